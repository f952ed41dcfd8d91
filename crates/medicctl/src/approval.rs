//! Approval prompt - nothing runs until the user says yes.

use crate::render::render_fix;
use medic_common::Fix;
use std::io::{self, BufRead, Write};

/// Show the fix plan on `output` and read the answer from `input`
pub fn request_approval<R: BufRead, W: Write>(fix: &Fix, input: &mut R, output: &mut W) -> io::Result<bool> {
    writeln!(output, "\nMedic proposes the following fix:\n")?;
    write!(output, "{}", render_fix(1, fix))?;
    if !fix.technical_details.is_empty() {
        writeln!(output, "\nDetails: {}", fix.technical_details)?;
    }
    write!(output, "\nApprove and execute? [y/N]: ")?;
    output.flush()?;

    let mut response = String::new();
    input.read_line(&mut response)?;
    let approved = is_approval(&response);

    if approved {
        writeln!(output, "Approved. Executing...\n")?;
    } else {
        writeln!(output, "Cancelled.\n")?;
    }
    Ok(approved)
}

/// Only an explicit yes counts
pub fn is_approval(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

/// Interactive prompt on the real terminal
pub fn request_approval_stdio(fix: &Fix) -> io::Result<bool> {
    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut output = io::stdout();
    request_approval(fix, &mut input, &mut output)
}
