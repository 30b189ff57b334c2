use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Every response line starts with one of these three-digit codes, followed by a single blank
///  and free text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum Status {
    Connect = 100,
    Success = 200,
    /// end of response - terminates the output of a single command
    End = 300,
    Error = 400,
}

pub const HEARTBEAT_REQUEST: &str = "PING";
pub const HEARTBEAT_RESPONSE: &str = "PONG";

pub const ACCEPT_TEXT: &str = "ACCEPT";
pub const END_TEXT: &str = "END";
pub const CONNECT_TEXT: &str = "CONNECT";

impl Status {
    pub fn code(self) -> u16 {
        self.into()
    }

    pub fn line(self, text: &str) -> String {
        format!("{} {}", self.code(), text)
    }

    pub fn end_line() -> String {
        Status::End.line(END_TEXT)
    }

    pub fn accept_line() -> String {
        Status::Success.line(ACCEPT_TEXT)
    }

    /// Splits a response line into its status and the text after it. Returns `None` for lines
    ///  that do not start with a known status code (e.g. heartbeat verbs).
    pub fn parse_line(line: &str) -> Option<(Status, &str)> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (code, text) = match line.split_once(' ') {
            Some((code, text)) => (code, text),
            None => (line, ""),
        };

        let code: u16 = code.parse().ok()?;
        let status = Status::try_from(code).ok()?;
        Some((status, text))
    }
}
