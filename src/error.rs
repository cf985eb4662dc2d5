use std::{error, fmt, io};

/// The crate's single error type. Every fallible operation in the loader, allocator, hash map
/// and interpreter returns `Result<_, FmlError>`; `main` is the only site that prints and maps
/// it to a process exit code.
#[derive(Debug)]
pub enum FmlError {
    /// Malformed command line invocation.
    Usage(String),
    /// The input file or the heap-log file could not be opened or read.
    Io(io::Error),
    /// The binary could not be decoded: bad tag, unknown opcode, truncated file.
    Decode(DecodeError),
    /// Decoding succeeded but the program could not be linked: unresolved label, bad entry point.
    Link(LinkError),
    /// A fully linked program failed during execution.
    Runtime(RuntimeError),
    /// The heap could not satisfy an allocation after a collection, or a structural limit
    /// (operand stack underflow, frame depth) was exceeded.
    Exhaustion(ExhaustionError),
}

#[derive(Debug, Clone)]
pub enum DecodeError {
    UnknownConstantTag(u8),
    UnknownOpcode(u8),
    UnexpectedClassMember,
    TruncatedFile,
}

#[derive(Debug, Clone)]
pub enum LinkError {
    UnresolvedLabel(String),
    EntryPointNotAMethod,
    UndefinedGlobal(String),
}

#[derive(Debug, Clone)]
pub enum RuntimeError {
    FormatArgMismatch,
    NotAFunction(String),
    NoMatchingOperator { receiver: &'static str, name: String },
    NotAnInstance,
    NonIntegerIndex,
    DivisionByZero,
    UnknownOpcode(u8),
}

#[derive(Debug, Clone)]
pub enum ExhaustionError {
    OutOfMemory,
    StackUnderflow,
    FrameOverflow,
}

impl fmt::Display for FmlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Usage(msg) => write!(f, "usage error: {msg}"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
            Self::Decode(err) => write!(f, "decode error: {err}"),
            Self::Link(err) => write!(f, "link error: {err}"),
            Self::Runtime(err) => write!(f, "runtime error: {err}"),
            Self::Exhaustion(err) => write!(f, "resource exhausted: {err}"),
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownConstantTag(tag) => write!(f, "unknown constant tag 0x{tag:02x}"),
            Self::UnknownOpcode(op) => write!(f, "unknown opcode 0x{op:02x} at link time"),
            Self::UnexpectedClassMember => write!(f, "class member is neither a method nor a slot"),
            Self::TruncatedFile => write!(f, "unexpected end of file"),
        }
    }
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnresolvedLabel(name) => write!(f, "jump target label {name:?} was never defined"),
            Self::EntryPointNotAMethod => write!(f, "entry point constant is not a method"),
            Self::UndefinedGlobal(name) => write!(f, "reference to undefined global {name:?}"),
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FormatArgMismatch => write!(f, "print format string and argument count disagree"),
            Self::NotAFunction(name) => write!(f, "global {name:?} is not callable"),
            Self::NoMatchingOperator { receiver, name } => {
                write!(f, "no operator {name:?} defined for {receiver}")
            }
            Self::NotAnInstance => write!(f, "field access on a non-instance value"),
            Self::NonIntegerIndex => write!(f, "array index is not an integer"),
            Self::DivisionByZero => write!(f, "division or modulo by zero"),
            Self::UnknownOpcode(op) => write!(f, "unknown opcode 0x{op:02x} at runtime"),
        }
    }
}

impl fmt::Display for ExhaustionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "heap exhausted after garbage collection"),
            Self::StackUnderflow => write!(f, "operand stack underflow"),
            Self::FrameOverflow => write!(f, "call frame depth exceeded"),
        }
    }
}

impl error::Error for FmlError {}

impl From<io::Error> for FmlError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<DecodeError> for FmlError {
    fn from(err: DecodeError) -> Self {
        Self::Decode(err)
    }
}

impl From<LinkError> for FmlError {
    fn from(err: LinkError) -> Self {
        Self::Link(err)
    }
}

impl From<RuntimeError> for FmlError {
    fn from(err: RuntimeError) -> Self {
        Self::Runtime(err)
    }
}

impl From<ExhaustionError> for FmlError {
    fn from(err: ExhaustionError) -> Self {
        Self::Exhaustion(err)
    }
}

impl FmlError {
    /// Maps this error to the historical process exit code it corresponds to.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            Self::Io(_) => 1,
            Self::Decode(DecodeError::UnexpectedClassMember) => 8,
            Self::Decode(_) => 2,
            Self::Link(LinkError::UnresolvedLabel(_)) => 54,
            Self::Link(LinkError::EntryPointNotAMethod) => 40,
            Self::Link(LinkError::UndefinedGlobal(_)) => 39,
            Self::Runtime(RuntimeError::NotAFunction(_)) => 40,
            Self::Runtime(RuntimeError::NoMatchingOperator { .. }) => 63,
            Self::Runtime(RuntimeError::NotAnInstance) => 123,
            Self::Runtime(_) => 22,
            Self::Exhaustion(ExhaustionError::StackUnderflow) => 77,
            Self::Exhaustion(ExhaustionError::FrameOverflow) => 21,
            Self::Exhaustion(ExhaustionError::OutOfMemory) => 11,
        }
    }
}
