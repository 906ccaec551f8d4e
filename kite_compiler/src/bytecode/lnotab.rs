//! Compressed line-number table.
//!
//! The table is a flat byte string of `(bytecode_delta, line_delta)` pairs.
//! Starting from offset 0 and the code's first line, each pair advances the
//! offset and the line; the line in effect for an offset is the one reached
//! after consuming every pair whose cumulative offset is `<=` that offset.
//!
//! Deltas are unsigned bytes. Larger deltas are split:
//!
//! ```text
//! bytecode delta 600, line delta 1   ->  (255,0) (255,0) (90,1)
//! bytecode delta 6,   line delta 300 ->  (6,255) (0,45)
//! ```
//!
//! Line numbers never go backwards in the table: an instruction whose line is
//! lower than the line already in effect emits nothing.

/// Incremental table writer driven by the assembler.
#[derive(Debug, Clone)]
pub struct LineTableBuilder {
    table: Vec<u8>,
    /// Line in effect after the last entry.
    line: u32,
    /// Bytecode offset of the last entry.
    line_offset: u32,
}

impl LineTableBuilder {
    /// Start a table for code whose first line is `first_line`.
    pub fn new(first_line: u32) -> Self {
        Self {
            table: Vec::new(),
            line: first_line,
            line_offset: 0,
        }
    }

    /// Record that the instruction at `offset` starts source line `line`.
    pub fn add(&mut self, offset: u32, line: u32) {
        // Same line continues, or the line went backwards.
        if line <= self.line || offset < self.line_offset {
            return;
        }
        let mut d_bytecode = offset - self.line_offset;
        let mut d_line = line - self.line;

        while d_bytecode > 255 {
            self.table.extend_from_slice(&[255, 0]);
            d_bytecode -= 255;
        }
        if d_line > 255 {
            self.table.extend_from_slice(&[d_bytecode as u8, 255]);
            d_bytecode = 0;
            d_line -= 255;
            while d_line > 255 {
                self.table.extend_from_slice(&[0, 255]);
                d_line -= 255;
            }
        }
        self.table.extend_from_slice(&[d_bytecode as u8, d_line as u8]);

        self.line = line;
        self.line_offset = offset;
    }

    /// Finish and return the encoded table.
    pub fn finish(self) -> Vec<u8> {
        self.table
    }
}

/// Line in effect at `offset`, reconstructed by summing deltas.
pub fn line_for_offset(table: &[u8], first_line: u32, offset: u32) -> u32 {
    let mut line = first_line;
    let mut addr = 0u32;
    for pair in table.chunks_exact(2) {
        addr += u32::from(pair[0]);
        if addr > offset {
            break;
        }
        line += u32::from(pair[1]);
    }
    line
}

/// Expand the table into `(offset, line)` transition points.
pub fn transitions(table: &[u8], first_line: u32) -> Vec<(u32, u32)> {
    let mut out = Vec::new();
    let mut line = first_line;
    let mut addr = 0u32;
    for pair in table.chunks_exact(2) {
        addr += u32::from(pair[0]);
        line += u32::from(pair[1]);
        if pair[1] != 0 {
            match out.last_mut() {
                Some((last_addr, last_line)) if *last_addr == addr => *last_line = line,
                _ => out.push((addr, line)),
            }
        }
    }
    out
}
