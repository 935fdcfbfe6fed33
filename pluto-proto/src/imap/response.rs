use pluto_mail::flags::{format_flag_list, ALL_FLAGS};
use pluto_mail::MailError;

/// The lines answering one command: zero or more untagged responses
/// followed by exactly one tagged completion. The distributor relays them
/// to the client verbatim, CRLF appended.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Response {
    pub lines: Vec<String>,
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn untagged(mut self, line: impl AsRef<str>) -> Self {
        self.lines.push(format!("* {}", line.as_ref()));
        self
    }

    pub fn ok(mut self, tag: &str, message: &str) -> Self {
        self.lines.push(format!("{} OK {}", tag, message));
        self
    }

    pub fn no(mut self, tag: &str, message: &str) -> Self {
        self.lines.push(format!("{} NO {}", tag, message));
        self
    }

    pub fn bad(mut self, tag: &str, message: &str) -> Self {
        self.lines.push(format!("{} BAD {}", tag, message));
        self
    }

    /// The untagged block every successful SELECT answers with.
    pub fn select_preamble(self, exists: u32, recent: u32) -> Self {
        let flags = format_flag_list(&ALL_FLAGS);
        self.untagged(format!("{} EXISTS", exists))
            .untagged(format!("{} RECENT", recent))
            .untagged(format!("FLAGS {}", flags))
            .untagged(format!("OK [PERMANENTFLAGS {}] Flags permitted", flags))
    }
}

/// Turn a command-level mailbox error into the right completion line. The
/// caller picks the human message for `NoSuchMailbox` because it differs
/// per verb (`TRYCREATE` for APPEND, plain NO elsewhere).
pub fn completion_for_error(tag: &str, command: &str, err: &MailError) -> Response {
    let r = Response::new();
    match err {
        MailError::NoSuchMailbox => match command {
            "APPEND" | "COPY" => r.no(
                tag,
                "[TRYCREATE] Mailbox to append to does not exist",
            ),
            _ => r.no(tag, &format!("Mailbox for {} does not exist", command)),
        },
        MailError::NoSuchMessage => r.no(tag, "No message with that sequence number"),
        MailError::MailboxExists => r.no(
            tag,
            "New mailbox cannot be named after already existing mailbox",
        ),
        MailError::Forbidden(msg) => r.no(tag, msg),
        MailError::Precondition(msg) => r.bad(tag, msg),
        MailError::Fatal(_) => r.no(tag, "Internal server error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_tagged_dialog() {
        let r = Response::new()
            .untagged("1 EXPUNGE")
            .ok("e", "EXPUNGE completed");
        assert_eq!(r.lines, vec!["* 1 EXPUNGE", "e OK EXPUNGE completed"]);
    }

    #[test]
    fn error_messages_match_the_protocol() {
        let r = completion_for_error("h", "CREATE", &MailError::MailboxExists);
        assert_eq!(
            r.lines,
            vec!["h NO New mailbox cannot be named after already existing mailbox"]
        );

        let r = completion_for_error("c", "DELETE", &MailError::Forbidden("Forbidden to delete INBOX"));
        assert_eq!(r.lines, vec!["c NO Forbidden to delete INBOX"]);

        let r = completion_for_error("b", "APPEND", &MailError::NoSuchMailbox);
        assert_eq!(
            r.lines,
            vec!["b NO [TRYCREATE] Mailbox to append to does not exist"]
        );
    }
}
