use std::{fmt, io};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    Internal = 3,
    Usage = 4,
    Cancelled = 5,
    Format = 6,
    Dwarf = 7,
    ProcessState = 9,
    NotImplemented = 10,
    Loading = 13,
    Sanity = 16,
    TooLong = 20,
    Syntax = 21,
    NoVariable = 22,
    TypeMismatch = 23,
    Runtime = 24,
    NoFunction = 25,
    NotContainer = 28,
    IncompleteType = 29,
    DescriptorConflict = 30,
    NoSuchChild = 31,
    EmptyContainer = 32,
    UnmappedMemory = 33,
    Timeout = 34,
}

#[derive(Debug)]
pub enum ErrorEnum {
    IO(io::Error),
    Code(ErrorCode),
}

#[derive(Clone)]
pub struct Error {
    pub error: ErrorEnum,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn from_io_error(e: io::Error, message: String) -> Error {
        Error {error: ErrorEnum::IO(e), message}
    }

    pub fn code(&self) -> Option<ErrorCode> { match self.error { ErrorEnum::Code(c) => Some(c), _ => None } }

    pub fn is_usage(&self) -> bool { self.code() == Some(ErrorCode::Usage) }
    pub fn is_loading(&self) -> bool { self.code() == Some(ErrorCode::Loading) }
    pub fn is_cancelled(&self) -> bool { self.code() == Some(ErrorCode::Cancelled) }
    pub fn is_syntax(&self) -> bool { self.code() == Some(ErrorCode::Syntax) }
    pub fn is_no_variable(&self) -> bool { self.code() == Some(ErrorCode::NoVariable) }
    pub fn is_type_mismatch(&self) -> bool { self.code() == Some(ErrorCode::TypeMismatch) }
    pub fn is_not_container(&self) -> bool { self.code() == Some(ErrorCode::NotContainer) }
    pub fn is_incomplete_type(&self) -> bool { self.code() == Some(ErrorCode::IncompleteType) }
    pub fn is_descriptor_conflict(&self) -> bool { self.code() == Some(ErrorCode::DescriptorConflict) }
    pub fn is_no_such_child(&self) -> bool { self.code() == Some(ErrorCode::NoSuchChild) }
    pub fn is_empty_container(&self) -> bool { self.code() == Some(ErrorCode::EmptyContainer) }
    pub fn is_unmapped_memory(&self) -> bool { self.code() == Some(ErrorCode::UnmappedMemory) }
    pub fn is_process_error(&self) -> bool { match self.code() { Some(ErrorCode::ProcessState) | Some(ErrorCode::Timeout) => true, _ => false } }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error {error: ErrorEnum::IO(error), message: String::new()}
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(error: std::num::ParseIntError) -> Self {
        Error {error: ErrorEnum::Code(ErrorCode::Format), message: format!("{}", error)}
    }
}

impl From<gimli::Error> for Error {
    fn from(error: gimli::Error) -> Self {
        Error {error: ErrorEnum::Code(ErrorCode::Dwarf), message: format!("{}", error)}
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(error: std::str::Utf8Error) -> Self {
        Error {error: ErrorEnum::Code(ErrorCode::Format), message: format!("{}", error)}
    }
}

impl From<std::fmt::Error> for Error {
    fn from(error: std::fmt::Error) -> Self {
        Error {error: ErrorEnum::Code(ErrorCode::Format), message: format!("{}", error)}
    }
}

// For printing to log.
impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error {
            &ErrorEnum::Code(code) => write!(f, "{}: {}", code as i64, self.message),
            ErrorEnum::IO(error) => write!(f, "{}: {}", self.message, error),
        }
    }
}

// For showing to the user.
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error {
            &ErrorEnum::Code(_) => write!(f, "{}", self.message),
            ErrorEnum::IO(error) if self.message.is_empty() => write!(f, "{}", error),
            ErrorEnum::IO(error) => write!(f, "{}: {}", self.message, error),
        }
    }
}

impl Clone for ErrorEnum {
    fn clone(&self) -> Self {
        match self {
            Self::Code(c) => Self::Code(c.clone()),
            Self::IO(e) => Self::IO(match e.raw_os_error() {
                Some(os) => io::Error::from_raw_os_error(os),
                None => e.kind().into(),
            }),
        }
    }
}

#[macro_export]
macro_rules! error {
    ($code:ident, $($arg:tt)*) => (
        $crate::error::Error {error: $crate::error::ErrorEnum::Code($crate::error::ErrorCode::$code), message: format!($($arg)*)}
    );
}

#[macro_export]
macro_rules! err {
    ($code:ident, $($arg:tt)*) => (
        Err($crate::error!($code, $($arg)*))
    );
}

#[macro_export]
macro_rules! errno_err {
    ($($arg:tt)*) => (
        Err($crate::error::Error {error: $crate::error::ErrorEnum::IO(::std::io::Error::last_os_error()), message: format!($($arg)*)})
    );
}
