#![forbid(unsafe_code)]
//! The textual simulation protocol.
//!
//! One configuration header, then `T + EXTRA_STEPS` steps framed by
//! `TIMESTAMP k` tokens. Each step's input is fully consumed before the
//! engine runs; the step's output is emitted afterwards in protocol
//! order and flushed once per step. Out-of-range records are rejected
//! here, at the boundary, and never reach the core.

use spindle_engine::{ReadRecord, Simulator, StepInput, StepReport, WriteRecord};
use spindle_error::{Result, SimError};
use spindle_planner::FrequencyTables;
use spindle_types::{ObjectId, RequestId, SimConfig, Tag};
use std::io::{BufRead, Write};

// ── Token scanning ──────────────────────────────────────────────────────────

/// Whitespace-separated token reader over any buffered input.
pub struct TokenScanner<R> {
    inner: R,
}

impl<R: BufRead> TokenScanner<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Next whitespace-delimited token.
    pub fn token(&mut self) -> Result<String> {
        let mut tok: Vec<u8> = Vec::new();
        loop {
            let buf = self.inner.fill_buf()?;
            if buf.is_empty() {
                if tok.is_empty() {
                    return Err(SimError::BadInput("unexpected end of input".into()));
                }
                break;
            }
            let mut consumed = 0;
            let mut done = false;
            for &b in buf {
                consumed += 1;
                if b.is_ascii_whitespace() {
                    if !tok.is_empty() {
                        done = true;
                        break;
                    }
                } else {
                    tok.push(b);
                }
            }
            self.inner.consume(consumed);
            if done {
                break;
            }
        }
        String::from_utf8(tok)
            .map_err(|_| SimError::BadInput("non-UTF-8 token in input".into()))
    }

    pub fn u32(&mut self) -> Result<u32> {
        let tok = self.token()?;
        tok.parse()
            .map_err(|_| SimError::BadInput(format!("expected integer, got {tok:?}")))
    }

    pub fn u64(&mut self) -> Result<u64> {
        let tok = self.token()?;
        tok.parse()
            .map_err(|_| SimError::BadInput(format!("expected integer, got {tok:?}")))
    }

    pub fn usize(&mut self) -> Result<usize> {
        let tok = self.token()?;
        tok.parse()
            .map_err(|_| SimError::BadInput(format!("expected count, got {tok:?}")))
    }

    /// Consume a token that must equal `expected`.
    pub fn literal(&mut self, expected: &str) -> Result<()> {
        let tok = self.token()?;
        if tok == expected {
            Ok(())
        } else {
            Err(SimError::BadInput(format!(
                "expected {expected:?}, got {tok:?}"
            )))
        }
    }
}

// ── Header ──────────────────────────────────────────────────────────────────

/// Read the five system constants and the three frequency tables.
pub fn read_header<R: BufRead>(
    scanner: &mut TokenScanner<R>,
) -> Result<(SimConfig, FrequencyTables)> {
    let cfg = SimConfig {
        steps: scanner.u32()?,
        categories: scanner.u32()?,
        disks: scanner.u32()?,
        units_per_disk: scanner.u32()?,
        tokens_per_step: scanner.u32()?,
    };
    cfg.validate()?;

    let mut read_table = |scanner: &mut TokenScanner<R>| -> Result<Vec<Vec<u64>>> {
        let mut table = Vec::with_capacity(cfg.categories as usize);
        for _ in 0..cfg.categories {
            let mut row = Vec::with_capacity(cfg.slice_count());
            for _ in 0..cfg.slice_count() {
                row.push(scanner.u64()?);
            }
            table.push(row);
        }
        Ok(table)
    };
    let deletes = read_table(scanner)?;
    let writes = read_table(scanner)?;
    let reads = read_table(scanner)?;

    let tables = FrequencyTables::new(&cfg, deletes, writes, reads)?;
    Ok((cfg, tables))
}

// ── Session ─────────────────────────────────────────────────────────────────

/// A full protocol session: header, then every step until the horizon.
pub struct Session<R, W> {
    scanner: TokenScanner<R>,
    out: W,
}

impl<R: BufRead, W: Write> Session<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self {
            scanner: TokenScanner::new(input),
            out: output,
        }
    }

    /// Drive the whole simulation. Returns after `T + EXTRA_STEPS` steps.
    pub fn run(mut self) -> Result<()> {
        let (cfg, tables) = read_header(&mut self.scanner)?;
        let mut sim = Simulator::new(cfg, &tables)?;
        writeln!(self.out, "OK")?;
        self.out.flush()?;

        for _ in 1..=cfg.total_steps() {
            self.step(&mut sim)?;
        }
        Ok(())
    }

    fn step(&mut self, sim: &mut Simulator) -> Result<()> {
        self.scanner.literal("TIMESTAMP")?;
        let stamp = self.scanner.u32()?;
        writeln!(self.out, "TIMESTAMP {stamp}")?;
        self.out.flush()?;

        let input = self.read_step_input(sim.config())?;
        let report = sim.step(input);
        self.emit_report(&report)?;
        self.out.flush()?;
        Ok(())
    }

    /// Consume the step's three batches, dropping records whose numbers
    /// are out of range for the configuration.
    fn read_step_input(&mut self, cfg: &SimConfig) -> Result<StepInput> {
        let mut input = StepInput::default();

        let n_del = self.scanner.usize()?;
        for _ in 0..n_del {
            input.deletes.push(ObjectId(self.scanner.u64()?));
        }

        let n_write = self.scanner.usize()?;
        for _ in 0..n_write {
            let id = ObjectId(self.scanner.u64()?);
            let size = self.scanner.u32()?;
            let tag = Tag(self.scanner.u32()?);
            if size == 0 || size > cfg.units_per_disk || !cfg.tag_in_range(tag) {
                tracing::warn!(
                    target: "spindle::proto",
                    object = id.0,
                    size,
                    tag = tag.0,
                    "write record out of range, dropped"
                );
                continue;
            }
            input.writes.push(WriteRecord { id, size, tag });
        }

        let n_read = self.scanner.usize()?;
        for _ in 0..n_read {
            input.reads.push(ReadRecord {
                request: RequestId(self.scanner.u64()?),
                object: ObjectId(self.scanner.u64()?),
            });
        }

        Ok(input)
    }

    fn emit_report(&mut self, report: &StepReport) -> Result<()> {
        writeln!(self.out, "{}", report.cancelled.len())?;
        for id in &report.cancelled {
            writeln!(self.out, "{id}")?;
        }

        for record in &report.created {
            writeln!(self.out, "{}", record.id)?;
            for replica in &record.replicas {
                write!(self.out, "{}", replica.disk)?;
                for u in replica.blocks.units() {
                    write!(self.out, " {u}")?;
                }
                writeln!(self.out)?;
            }
        }

        for (_, plan) in &report.plans {
            writeln!(self.out, "{plan}")?;
        }

        writeln!(self.out, "{}", report.completed.len())?;
        for id in &report.completed {
            writeln!(self.out, "{id}")?;
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scanner_splits_on_any_whitespace() {
        let mut s = TokenScanner::new("12  34\n\tTIMESTAMP 5".as_bytes());
        assert_eq!(s.u32().unwrap(), 12);
        assert_eq!(s.u64().unwrap(), 34);
        s.literal("TIMESTAMP").unwrap();
        assert_eq!(s.usize().unwrap(), 5);
        assert!(matches!(s.token(), Err(SimError::BadInput(_))));
    }

    #[test]
    fn scanner_rejects_non_numeric() {
        let mut s = TokenScanner::new("x".as_bytes());
        assert!(matches!(s.u32(), Err(SimError::BadInput(_))));
    }

    #[test]
    fn header_parses_tables_in_delete_write_read_order() {
        let text = "10 2 3 100 128\n1 2\n3 4\n5 6\n"; // M=2, one slice each
        let mut s = TokenScanner::new(text.as_bytes());
        let (cfg, tables) = read_header(&mut s).unwrap();
        assert_eq!(cfg.categories, 2);
        assert_eq!(cfg.slice_count(), 1);
        assert_eq!(tables.slice_count(), 1);
    }

    #[test]
    fn header_rejects_zero_parameters() {
        let mut s = TokenScanner::new("0 1 3 100 128".as_bytes());
        assert!(read_header(&mut s).is_err());
    }
}
