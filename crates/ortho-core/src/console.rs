//! Terminal output with an optional tee file.
//!
//! Everything the supervisor prints for the user goes through [`say`] so that a
//! configured `tee` path receives an identical copy.

use anyhow::Result;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

const GREY: &str = "\x1b[90m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

fn tee_slot() -> &'static Mutex<Option<File>> {
    static TEE: OnceLock<Mutex<Option<File>>> = OnceLock::new();
    TEE.get_or_init(|| Mutex::new(None))
}

pub fn install_tee(path: &Path) -> Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    if let Ok(mut slot) = tee_slot().lock() {
        *slot = Some(file);
    }
    Ok(())
}

fn tee_line(line: &str) {
    if let Ok(mut slot) = tee_slot().lock() {
        if let Some(file) = slot.as_mut() {
            let _ = writeln!(file, "{}", strip_ansi(line));
        }
    }
}

pub fn say(line: &str) {
    println!("{}", line);
    tee_line(line);
}

pub fn say_err(line: &str) {
    eprintln!("{}", line);
    tee_line(line);
}

pub fn status(message: &str) {
    say(&format!("[STATUS] {}", message));
}

pub fn note(message: &str) {
    say(&format!("[NOTE] {}", message));
}

/// Grey traceback banner followed by a single red `[ERROR]` line.
pub fn error_report(traceback: &[String], message: &str) {
    if !traceback.is_empty() {
        say_err(&format!("{}[TRACEBACK]{}", GREY, RESET));
        for line in traceback {
            say_err(&format!("{}{}{}", GREY, line, RESET));
        }
    }
    say_err(&format!("{}[ERROR]{} {}", RED, RESET, message));
}

pub fn strip_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\x1b' && chars.peek() == Some(&'[') {
            chars.next();
            for n in chars.by_ref() {
                if n.is_ascii_alphabetic() {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}
