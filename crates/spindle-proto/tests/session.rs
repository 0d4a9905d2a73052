#![forbid(unsafe_code)]
//! Byte-for-byte protocol sessions through `Session::run`.

use spindle_proto::Session;
use spindle_types::EXTRA_STEPS;

/// Header for `T=1 M=1 N=3 V=100 G=128` with empty frequency tables.
fn tiny_header() -> String {
    "1 1 3 100 128\n0\n0\n0\n".to_owned()
}

fn empty_step_input(k: u32) -> String {
    format!("TIMESTAMP {k}\n0\n0\n0\n")
}

/// Step output with no cancellations, writes, or completions; three
/// disks each emit `#`.
fn idle_step_output(k: u32) -> String {
    format!("TIMESTAMP {k}\n0\n#\n#\n#\n0\n")
}

fn run_session(input: &str) -> String {
    let mut output = Vec::new();
    Session::new(input.as_bytes(), &mut output)
        .run()
        .expect("session should complete");
    String::from_utf8(output).expect("protocol output is ASCII")
}

#[test]
fn write_read_session_completes_in_step_two() {
    let total = 1 + EXTRA_STEPS;
    let mut input = tiny_header();
    input.push_str("TIMESTAMP 1\n0\n1\n7 3 1\n1\n1 7\n");
    for k in 2..=total {
        input.push_str(&empty_step_input(k));
    }

    let mut expected = String::from("OK\n");
    // Step 1: object 7 lands at units 1..=3 on disks 1..=3; two of the
    // three reads fit the 128-token budget.
    expected.push_str("TIMESTAMP 1\n0\n7\n1 1 2 3\n2 1 2 3\n3 1 2 3\nrr#\n#\n#\n0\n");
    // Step 2: the warm third read finishes request 1.
    expected.push_str("TIMESTAMP 2\n0\nr#\n#\n#\n1\n1\n");
    for k in 3..=total {
        expected.push_str(&idle_step_output(k));
    }

    assert_eq!(run_session(&input), expected);
}

#[test]
fn delete_session_reports_cancelled_requests() {
    let total = 1 + EXTRA_STEPS;
    let mut input = tiny_header();
    input.push_str("TIMESTAMP 1\n0\n1\n9 3 1\n3\n1 9\n2 9\n3 9\n");
    input.push_str("TIMESTAMP 2\n1\n9\n0\n0\n");
    for k in 3..=total {
        input.push_str(&empty_step_input(k));
    }

    let mut expected = String::from("OK\n");
    expected.push_str("TIMESTAMP 1\n0\n9\n1 1 2 3\n2 1 2 3\n3 1 2 3\nrr#\n#\n#\n0\n");
    // All three consolidated requests die with the object; the pending
    // third unit is withdrawn, so no disk emits work.
    expected.push_str("TIMESTAMP 2\n3\n1\n2\n3\n#\n#\n#\n0\n");
    for k in 3..=total {
        expected.push_str(&idle_step_output(k));
    }

    assert_eq!(run_session(&input), expected);
}

#[test]
fn out_of_range_write_is_dropped_at_the_boundary() {
    let total = 1 + EXTRA_STEPS;
    let mut input = tiny_header();
    // Category 0 does not exist; the record must not reach the core.
    input.push_str("TIMESTAMP 1\n0\n1\n5 3 0\n0\n");
    for k in 2..=total {
        input.push_str(&empty_step_input(k));
    }

    let mut expected = String::from("OK\n");
    for k in 1..=total {
        expected.push_str(&idle_step_output(k));
    }

    assert_eq!(run_session(&input), expected);
}

#[test]
fn truncated_input_is_a_protocol_error() {
    let input = "1 1 3 100 128\n0\n0\n0\nTIMESTAMP 1\n0\n";
    let mut output = Vec::new();
    assert!(Session::new(input.as_bytes(), &mut output).run().is_err());
}
