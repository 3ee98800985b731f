//! CLI utilities for framewire.
//!
//! The helpers here back the interactive client: they read one input record at
//! a time and recognise the shell's own commands.
use std::io::{self, BufRead, Write};

/// Byte that ends an input record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delimiter {
    /// Every line is a request.
    Newline,
    /// Requests may span lines and end with `#`.
    Hash,
}

impl Delimiter {
    fn byte(self) -> u8 {
        match self {
            Delimiter::Newline => b'\n',
            Delimiter::Hash => b'#',
        }
    }
}

/// Possible inputs from a user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShellCommand {
    /// `exit`: end the session.
    Exit,
    /// `multiline`: switch to `#`-terminated input.
    Multiline,
    /// `recover`: switch back to line input.
    Recover,
    /// Anything else is sent to the server.
    Message(String),
}

impl From<String> for ShellCommand {
    fn from(value: String) -> Self {
        match value.as_str() {
            "exit" => ShellCommand::Exit,
            "multiline" => ShellCommand::Multiline,
            "recover" => ShellCommand::Recover,
            _ => ShellCommand::Message(value),
        }
    }
}

/// Read everything up to `delimiter`, without the delimiter.
///
/// Returns `None` once the reader is exhausted. In [`Delimiter::Hash`] mode a
/// newline right after `#` is consumed as well.
pub fn read_record<R: BufRead>(reader: &mut R, delimiter: Delimiter) -> io::Result<Option<String>> {
    let mut record = Vec::new();
    if reader.read_until(delimiter.byte(), &mut record)? == 0 {
        return Ok(None);
    }

    if record.last() == Some(&delimiter.byte()) {
        record.pop();
    }
    match delimiter {
        Delimiter::Newline => {
            if record.last() == Some(&b'\r') {
                record.pop();
            }
        }
        Delimiter::Hash => {
            if reader.fill_buf()?.first() == Some(&b'\n') {
                reader.consume(1);
            }
        }
    }

    Ok(Some(String::from_utf8_lossy(&record).into_owned()))
}

/// Prompt the user and read one command, `None` at end of input.
pub fn prompt<R, W>(
    reader: &mut R,
    writer: &mut W,
    delimiter: Delimiter,
) -> io::Result<Option<ShellCommand>>
where
    R: BufRead,
    W: Write,
{
    write!(writer, "> ")?;
    writer.flush()?;

    Ok(read_record(reader, delimiter)?.map(ShellCommand::from))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_prints_correctly() {
        let mut input = &b"exit\n"[..];
        let mut output = Vec::new();

        prompt(&mut input, &mut output, Delimiter::Newline).unwrap();

        let output = String::from_utf8(output).expect("not valid UTF-8");
        assert_eq!("> ", output);
    }

    #[test]
    fn prompt_recognises_commands() {
        let mut input = &b"exit\nmultiline\nrecover\nhello there\n"[..];
        let mut output = Vec::new();
        let mut next = || prompt(&mut input, &mut output, Delimiter::Newline).unwrap();

        assert_eq!(next(), Some(ShellCommand::Exit));
        assert_eq!(next(), Some(ShellCommand::Multiline));
        assert_eq!(next(), Some(ShellCommand::Recover));
        assert_eq!(next(), Some(ShellCommand::Message("hello there".into())));
        assert_eq!(next(), None);
    }

    #[test]
    fn prompt_handles_empty_line() {
        let mut input = &b"\n"[..];
        let mut output = Vec::new();

        let res = prompt(&mut input, &mut output, Delimiter::Newline).unwrap();
        assert_eq!(Some(ShellCommand::Message(String::new())), res);
    }

    #[test]
    fn multiline_record_ends_at_hash() {
        let mut input = &b"first line\nsecond line#\nnext#"[..];

        let record = read_record(&mut input, Delimiter::Hash).unwrap();
        assert_eq!(record.as_deref(), Some("first line\nsecond line"));
        let record = read_record(&mut input, Delimiter::Hash).unwrap();
        assert_eq!(record.as_deref(), Some("next"));
        assert_eq!(read_record(&mut input, Delimiter::Hash).unwrap(), None);
    }

    #[test]
    fn line_record_strips_carriage_return() {
        let mut input = &b"windows\r\nunterminated"[..];

        let record = read_record(&mut input, Delimiter::Newline).unwrap();
        assert_eq!(record.as_deref(), Some("windows"));
        let record = read_record(&mut input, Delimiter::Newline).unwrap();
        assert_eq!(record.as_deref(), Some("unterminated"));
    }
}
