//! Client session policy
//!
//! The broker only ever offers one kind of channel: an interactive
//! `session` whose sole purpose is to keep the client connection alive.
//! Every request is evaluated on its own; accepting a shell does not make
//! later requests on the same channel acceptable.
//!
//! russh parses channel requests before they reach the handler and does
//! not pass on bytes trailing a `shell` request, so requests are judged by
//! type alone.

mod shell;

pub use shell::{run_interactive, Echo, LineEcho, PROMPT};

use wh_protocol::channel_request;

/// Whether a request of type `kind` on a session channel gets a success reply
pub fn accepts_request(kind: &str) -> bool {
    kind == channel_request::SHELL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_is_accepted() {
        assert!(accepts_request("shell"));
    }

    #[test]
    fn test_other_requests_are_rejected() {
        for kind in ["exec", "pty-req", "env", "subsystem", "window-change", "x11-req", ""] {
            assert!(!accepts_request(kind), "{} accepted", kind);
        }
    }

    #[test]
    fn test_requests_are_independent() {
        let sequence = ["shell", "exec", "shell", "pty-req", "shell"];
        let replies: Vec<bool> = sequence.iter().map(|kind| accepts_request(kind)).collect();
        assert_eq!(replies, vec![true, false, true, false, true]);
    }
}
