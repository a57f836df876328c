//! Stdout writer for the control line.
//!
//! - **stdout**: control messages, one JSON document per line
//! - **stderr**: logs
//!
//! Lines end with an explicit `\n` rather than going through `println!`.

use std::io::Write;

/// Write `line` plus `\n` to stdout and flush.
pub fn write_stdout_line(line: &str) -> std::io::Result<()> {
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    handle.write_all(line.as_bytes())?;
    handle.write_all(b"\n")?;
    handle.flush()?;
    Ok(())
}

/// Serialize `value` to JSON and write it as one line.
pub fn write_stdout_json<T: serde::Serialize>(value: &T) -> crate::error::Result<()> {
    let json = serde_json::to_string(value)?;
    write_stdout_line(&json)?;
    Ok(())
}
