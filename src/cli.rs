//! Shared look of the command line tools.

use std::{fs::File, os::fd::AsRawFd};

use anstyle::{AnsiColor, Color, Style};
use terminal_size::{terminal_size, terminal_size_using_fd, Width};

fn fg(color: AnsiColor) -> Style {
    Style::new().fg_color(Some(Color::Ansi(color)))
}

pub fn clap_styles() -> clap::builder::Styles {
    clap::builder::Styles::styled()
        .usage(fg(AnsiColor::Cyan).bold().underline())
        .header(fg(AnsiColor::Cyan).bold().underline())
        .literal(fg(AnsiColor::Green))
        .placeholder(fg(AnsiColor::BrightBlack))
        .valid(fg(AnsiColor::Green).bold())
        .invalid(fg(AnsiColor::Yellow).bold())
        .error(fg(AnsiColor::Red).bold())
}

/// Width for clap's help output: of the controlling terminal if there
/// is one (stdout may be redirected), else of stdout, else 100.
pub fn terminal_width() -> usize {
    let size = match File::open("/dev/tty") {
        Ok(tty) => terminal_size_using_fd(tty.as_raw_fd()),
        Err(_) => terminal_size(),
    };
    match size {
        Some((Width(w), _)) if w > 20 => usize::from(w) - 2,
        _ => 100,
    }
}
