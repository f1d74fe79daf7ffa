//! Terminal output for srcfetch
//!
//! Progress lines go to stdout, warnings and errors to stderr. Colors come
//! from owo-colors; spinners and byte bars live in [`super::progress`].

use owo_colors::OwoColorize;

const MARK: &str = "==>";
const DETAIL_INDENT: &str = "     ";

/// `==> zlib 1.3.1` header for a package or command
pub fn action(message: &str) {
    println!("{} {}", MARK.blue().bold(), message.bold());
}

/// `(2/7) mpfr 4.2.1` header while walking the manifest
pub fn action_numbered(current: usize, total: usize, message: &str) {
    let counter = format!("({}/{})", current, total);
    println!("{} {}", counter.cyan(), message.bold());
}

/// `  -> Building zlib` pipeline stage
pub fn sub_action(stage: &str) {
    println!("  {} {}", "->".cyan(), stage);
}

/// Dimmed line under the current stage
pub fn detail(message: &str) {
    println!("{}{}", DETAIL_INDENT, message.dimmed());
}

pub fn success(message: &str) {
    println!("{} {}", MARK.green().bold(), message.green());
}

pub fn info(message: &str) {
    println!("{} {}", "::".cyan(), message);
}

/// Stage or package left alone because its work is already done
pub fn skip(message: &str) {
    println!("{} {}", MARK.dimmed(), message.dimmed());
}

pub fn warning(message: &str) {
    eprintln!("{} {}", "warning:".yellow().bold(), message.yellow());
}

pub fn error(message: &str) {
    eprintln!("{} {}", "error:".red().bold(), message.red());
}

/// One `status` row; finished packages are highlighted.
pub fn list_item(name: &str, state: &str, done: bool) {
    if done {
        println!("  {} {}", name.green(), state.dimmed());
    } else {
        println!("  {} {}", name, state.dimmed());
    }
}
