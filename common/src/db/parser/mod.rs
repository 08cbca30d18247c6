pub mod def;
pub mod lef;

use thiserror::Error;

/// Input-validation failure with file/line context. Any of these aborts
/// loading; geometry oddities that have a fallback are logged instead.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("{file}:{line}: unknown layer '{name}'")]
    UnknownLayer {
        file: String,
        line: usize,
        name: String,
    },
    #[error("{file}:{line}: unknown macro '{name}'")]
    UnknownMacro {
        file: String,
        line: usize,
        name: String,
    },
    #[error("{file}:{line}: 90-degree rotated orientation '{orient}' is not supported")]
    RotatedOrientation {
        file: String,
        line: usize,
        orient: String,
    },
    #[error("{file}:{line}: malformed {section} statement: {detail}")]
    Malformed {
        file: String,
        line: usize,
        section: String,
        detail: String,
    },
    #[error("{1}: {0}")]
    Io(#[source] std::io::Error, String),
}

impl ParseError {
    pub fn malformed(file: &str, line: usize, section: &str, detail: impl Into<String>) -> Self {
        ParseError::Malformed {
            file: file.to_string(),
            line,
            section: section.to_string(),
            detail: detail.into(),
        }
    }
}
