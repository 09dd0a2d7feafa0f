//! PGM image output.
//!
//! 8-bit grayscale only. The binary (`P5`) form stores raw pixel
//! bytes; the ASCII (`P2`) form is for eyeballing small frames. The
//! header maxval is the observed maximum so viewers stretch contrast
//! sensibly.

use std::io::{BufWriter, Write};
use std::path::Path;

use ao_frame::Frame;

use crate::Result;

fn observed_max(frame: &Frame) -> u8 {
    let mut max = 0u8;
    for y in 0..frame.height() {
        for &p in frame.row(y) {
            if p > max {
                max = p;
            }
        }
    }
    max.max(1)
}

/// Write a binary (`P5`) PGM file.
pub fn write_binary(path: &Path, frame: &Frame) -> Result<()> {
    let f = std::fs::File::create(path)?;
    let mut w = BufWriter::new(f);
    write!(w, "P5\n{} {}\n{}\n", frame.width(), frame.height(), observed_max(frame))?;
    for y in 0..frame.height() {
        w.write_all(frame.row(y))?;
    }
    w.flush()?;
    Ok(())
}

/// Write an ASCII (`P2`) PGM file.
///
/// Lines are wrapped below 70 characters as the format requires.
pub fn write_ascii(path: &Path, frame: &Frame) -> Result<()> {
    let f = std::fs::File::create(path)?;
    let mut w = BufWriter::new(f);
    write!(w, "P2\n{} {}\n{}\n", frame.width(), frame.height(), observed_max(frame))?;
    let mut linew = 0usize;
    for y in 0..frame.height() {
        for &p in frame.row(y) {
            let cell = format!("{} ", p);
            if linew + cell.len() > 70 {
                w.write_all(b"\n")?;
                linew = 0;
            }
            w.write_all(cell.as_bytes())?;
            linew += cell.len();
        }
        w.write_all(b"\n")?;
        linew = 0;
    }
    w.flush()?;
    Ok(())
}
