const BANNER_WIDTH: usize = 72;
const KEY_WIDTH: usize = 12;
const LOGO: &[&str] = &[
    " _  _____ _     _   _ ",
    "| |/ /_ _| |   | \\ | |",
    "| ' / | || |   |  \\| |",
    "| . \\ | || |___| |\\  |",
    "|_|\\_\\___|_____|_| \\_|",
];

pub fn startup_banner(title: &str, lines: &[(&str, String)]) {
    let border = "=".repeat(BANNER_WIDTH);
    println!();
    println!("{border}");
    for line in LOGO {
        println!("{:^width$}", line, width = BANNER_WIDTH);
    }
    println!("{:^width$}", title, width = BANNER_WIDTH);
    println!("{}", "-".repeat(BANNER_WIDTH));
    for (key, value) in lines {
        println!("{}", key_value(key, value));
    }
    println!("{border}");
    println!();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Info,
    Success,
    Warn,
    Error,
}

impl Level {
    fn label(self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Success => " OK ",
            Level::Warn => "WARN",
            Level::Error => "ERR ",
        }
    }

    /// Warnings and errors go to stderr.
    fn uses_stderr(self) -> bool {
        matches!(self, Level::Warn | Level::Error)
    }
}

fn emit(level: Level, tag: &str, message: &str) {
    let line = format_line(level, tag, message);
    if level.uses_stderr() {
        eprintln!("{line}");
    } else {
        println!("{line}");
    }
}

fn format_line(level: Level, tag: &str, message: &str) -> String {
    format!("[{}][{tag:<8}] {message}", level.label())
}

pub fn info(tag: &str, message: impl AsRef<str>) {
    emit(Level::Info, tag, message.as_ref());
}

pub fn success(tag: &str, message: impl AsRef<str>) {
    emit(Level::Success, tag, message.as_ref());
}

pub fn warn(tag: &str, message: impl AsRef<str>) {
    emit(Level::Warn, tag, message.as_ref());
}

pub fn error(tag: &str, message: impl AsRef<str>) {
    emit(Level::Error, tag, message.as_ref());
}

/// Aligned `key: value` row, shared by the banner and register dumps.
pub fn key_value(key: &str, value: impl AsRef<str>) -> String {
    format!(
        "  {:<key_width$} {}",
        format!("{key}:"),
        value.as_ref(),
        key_width = KEY_WIDTH
    )
}

pub fn device_tag(device: Option<usize>) -> String {
    match device {
        Some(index) => format!("GPU {index}"),
        None => "BURN".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_pad_short_tags() {
        assert_eq!(
            format_line(Level::Info, "GPU 1", "ready"),
            "[INFO][GPU 1   ] ready"
        );
        assert_eq!(
            format_line(Level::Warn, "LONGERTAG", "x"),
            "[WARN][LONGERTAG] x"
        );
        assert_eq!(format_line(Level::Success, "BURN", "ok"), "[ OK ][BURN    ] ok");
    }

    #[test]
    fn only_warnings_and_errors_use_stderr() {
        assert!(!Level::Info.uses_stderr());
        assert!(!Level::Success.uses_stderr());
        assert!(Level::Warn.uses_stderr());
        assert!(Level::Error.uses_stderr());
    }

    #[test]
    fn key_value_aligns_values() {
        assert_eq!(key_value("devices", "all"), "  devices:     all");
    }

    #[test]
    fn device_tag_falls_back_to_engine_tag() {
        assert_eq!(device_tag(Some(3)), "GPU 3");
        assert_eq!(device_tag(None), "BURN");
    }
}
