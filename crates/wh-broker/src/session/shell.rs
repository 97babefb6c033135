//! Interactive keepalive shell
//!
//! Echoes what the client types, line by line, and never executes anything.

use bytes::{BufMut, BytesMut};
use russh::server::Msg;
use russh::{Channel, ChannelMsg};
use tokio_util::sync::CancellationToken;

/// Prompt written at the start of every line
pub const PROMPT: &[u8] = b"> ";

const CTRL_C: u8 = 0x03;
const CTRL_D: u8 = 0x04;
const BACKSPACE: u8 = 0x08;
const DELETE: u8 = 0x7f;

/// Output produced for one chunk of input
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Echo {
    /// Bytes to send back to the client
    pub output: BytesMut,
    /// The client asked to end the session (Ctrl-D on an empty line)
    pub hangup: bool,
}

/// Minimal line discipline for a raw-mode terminal
#[derive(Debug, Default)]
pub struct LineEcho {
    line: Vec<u8>,
    after_cr: bool,
}

impl LineEcho {
    pub fn new() -> Self {
        Self::default()
    }

    /// The line typed so far
    pub fn line(&self) -> &[u8] {
        &self.line
    }

    pub fn feed(&mut self, input: &[u8]) -> Echo {
        let mut echo = Echo::default();

        for &byte in input {
            let after_cr = std::mem::replace(&mut self.after_cr, false);
            match byte {
                b'\n' if after_cr => {}
                b'\r' | b'\n' => {
                    self.after_cr = byte == b'\r';
                    if !self.line.is_empty() {
                        tracing::trace!("Shell line: {:?}", String::from_utf8_lossy(&self.line));
                    }
                    self.line.clear();
                    echo.output.put_slice(b"\r\n");
                    echo.output.put_slice(PROMPT);
                }
                BACKSPACE | DELETE => {
                    if self.pop_char() {
                        echo.output.put_slice(b"\x08 \x08");
                    }
                }
                CTRL_C => {
                    self.line.clear();
                    echo.output.put_slice(b"^C\r\n");
                    echo.output.put_slice(PROMPT);
                }
                CTRL_D if self.line.is_empty() => {
                    echo.hangup = true;
                    break;
                }
                0x20..=0x7e | 0x80..=0xff => {
                    self.line.push(byte);
                    echo.output.put_u8(byte);
                }
                _ => {}
            }
        }

        echo
    }

    /// Remove the last character, including UTF-8 continuation bytes
    fn pop_char(&mut self) -> bool {
        while let Some(byte) = self.line.pop() {
            if byte & 0xc0 != 0x80 {
                return true;
            }
        }
        false
    }
}

/// Serve the keepalive shell on `channel` until the client leaves
pub async fn run_interactive(mut channel: Channel<Msg>, cancel: CancellationToken) {
    let id = channel.id();
    let mut echo = LineEcho::new();

    if channel.data(PROMPT).await.is_err() {
        return;
    }

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = channel.wait() => msg,
        };

        match msg {
            Some(ChannelMsg::Data { data }) => {
                let reply = echo.feed(&data);
                if !reply.output.is_empty() && channel.data(&reply.output[..]).await.is_err() {
                    break;
                }
                if reply.hangup {
                    tracing::debug!("Client ended shell on channel {:?}", id);
                    break;
                }
            }
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }

    let _ = channel.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(echo: &Echo) -> &[u8] {
        &echo.output[..]
    }

    #[test]
    fn test_printable_bytes_echo() {
        let mut shell = LineEcho::new();
        let echo = shell.feed(b"hi there");
        assert_eq!(output(&echo), b"hi there");
        assert!(!echo.hangup);
        assert_eq!(shell.line(), b"hi there");
    }

    #[test]
    fn test_enter_prints_new_prompt() {
        let mut shell = LineEcho::new();
        let echo = shell.feed(b"ls\r");
        assert_eq!(output(&echo), b"ls\r\n> ");
        assert!(shell.line().is_empty());
    }

    #[test]
    fn test_crlf_counts_as_one_line_end() {
        let mut shell = LineEcho::new();
        assert_eq!(output(&shell.feed(b"a\r\nb")), b"a\r\n> b");

        let mut split = LineEcho::new();
        split.feed(b"a\r");
        assert_eq!(output(&split.feed(b"\nb")), b"b");
    }

    #[test]
    fn test_bare_newline_ends_line() {
        let mut shell = LineEcho::new();
        assert_eq!(output(&shell.feed(b"x\n\n")), b"x\r\n> \r\n> ");
    }

    #[test]
    fn test_backspace() {
        let mut shell = LineEcho::new();
        let echo = shell.feed(b"ab\x7f");
        assert_eq!(output(&echo), b"ab\x08 \x08");
        assert_eq!(shell.line(), b"a");

        let echo = shell.feed(b"\x08\x08");
        assert_eq!(output(&echo), b"\x08 \x08");
        assert!(shell.line().is_empty());
    }

    #[test]
    fn test_backspace_removes_whole_utf8_char() {
        let mut shell = LineEcho::new();
        shell.feed("aé".as_bytes());
        shell.feed(b"\x7f");
        assert_eq!(shell.line(), b"a");
    }

    #[test]
    fn test_ctrl_c_discards_line() {
        let mut shell = LineEcho::new();
        shell.feed(b"rm -rf");
        let echo = shell.feed(&[CTRL_C]);
        assert_eq!(output(&echo), b"^C\r\n> ");
        assert!(shell.line().is_empty());
    }

    #[test]
    fn test_ctrl_d_on_empty_line_hangs_up() {
        let mut shell = LineEcho::new();
        let echo = shell.feed(&[CTRL_D, b'x']);
        assert!(echo.hangup);
        assert!(echo.output.is_empty());
    }

    #[test]
    fn test_ctrl_d_mid_line_is_ignored() {
        let mut shell = LineEcho::new();
        let echo = shell.feed(&[b'x', CTRL_D]);
        assert!(!echo.hangup);
        assert_eq!(output(&echo), b"x");
    }

    #[test]
    fn test_escape_byte_is_dropped() {
        let mut shell = LineEcho::new();
        let echo = shell.feed(b"\x1b[A");
        assert_eq!(output(&echo), b"[A");
    }
}
