use std::sync::Arc;

use pluto_mail::mailbox::normalize_name;
use pluto_mail::{AppendInProgress, MailError, UserMailbox};

use crate::imap::command::Command;
use crate::imap::response::{completion_for_error, Response};

/// Per-session IMAP state on the serving node. `NotAuthenticated` never
/// appears here: the distributor only prepares a session after a
/// successful LOGIN.
pub enum State {
    Authenticated,
    Mailbox { selected: String },
    AppendWait(Box<PendingAppend>),
    Logout,
}

pub struct PendingAppend {
    pending: AppendInProgress,
    tag: String,
    /// Mailbox selected before APPEND started, restored afterwards.
    selected: Option<String>,
}

pub struct Session {
    pub user: String,
    /// Name of the worker owning this user; the routing tag of the reply
    /// pipe, useful mostly in logs.
    pub resp_worker: String,
    pub state: State,
}

/// What one dispatched command produced.
pub enum CommandOutcome {
    Done(Response),
    /// APPEND announced a literal: invite the client and feed the bytes to
    /// `append_literal`.
    AwaitLiteral(usize),
    /// The node cannot continue consistently (disk failure mid-commit).
    Fatal(String),
}

fn fatal(err: anyhow::Error) -> CommandOutcome {
    tracing::error!("fatal mailbox failure: {:#}", err);
    CommandOutcome::Fatal(err.to_string())
}

impl Session {
    pub fn new(user: &str, resp_worker: &str, selected: Option<String>) -> Self {
        Self {
            user: user.to_string(),
            resp_worker: resp_worker.to_string(),
            state: match selected {
                Some(selected) => State::Mailbox { selected },
                None => State::Authenticated,
            },
        }
    }

    fn selected(&self) -> Option<String> {
        match &self.state {
            State::Mailbox { selected } => Some(selected.clone()),
            _ => None,
        }
    }

    /// Dispatch one command against the user's mailbox state.
    pub async fn command(
        &mut self,
        mailbox: &Arc<UserMailbox>,
        tag: &str,
        command: Command,
    ) -> CommandOutcome {
        use CommandOutcome::Done;

        if matches!(self.state, State::Logout) {
            return Done(Response::new().bad(tag, "No commands are allowed in the LOGOUT state"));
        }
        if matches!(self.state, State::AppendWait(_)) {
            return Done(Response::new().bad(tag, "Awaiting literal data for APPEND"));
        }

        match command {
            Command::Capability => Done(
                Response::new()
                    .untagged("CAPABILITY IMAP4rev1")
                    .ok(tag, "CAPABILITY completed"),
            ),
            Command::Noop => Done(Response::new().ok(tag, "NOOP completed")),
            Command::Logout => {
                self.state = State::Logout;
                Done(
                    Response::new()
                        .untagged("BYE Terminating connection")
                        .ok(tag, "LOGOUT completed"),
                )
            }
            Command::Login { .. } => Done(Response::new().bad(tag, "Already logged in")),

            Command::Select { mailbox: name } => match mailbox.select(&name).await {
                Ok(summary) => {
                    self.state = State::Mailbox {
                        selected: normalize_name(&name),
                    };
                    Done(
                        Response::new()
                            .select_preamble(summary.exists, summary.recent)
                            .ok(tag, "[READ-WRITE] SELECT completed"),
                    )
                }
                Err(MailError::Fatal(e)) => fatal(e),
                Err(e) => {
                    self.state = State::Authenticated;
                    Done(completion_for_error(tag, "SELECT", &e))
                }
            },

            Command::Create { mailbox: name } => match mailbox.create(&name).await {
                Ok(()) => Done(Response::new().ok(tag, "CREATE completed")),
                Err(MailError::Fatal(e)) => fatal(e),
                Err(e) => Done(completion_for_error(tag, "CREATE", &e)),
            },

            Command::Delete { mailbox: name } => match mailbox.delete(&name).await {
                Ok(()) => {
                    // Deleting the selected mailbox drops the selection
                    if self.selected().as_deref() == Some(normalize_name(&name).as_str()) {
                        self.state = State::Authenticated;
                    }
                    Done(Response::new().ok(tag, "DELETE completed"))
                }
                Err(MailError::Fatal(e)) => fatal(e),
                Err(e) => Done(completion_for_error(tag, "DELETE", &e)),
            },

            Command::Rename { from, to } => match mailbox.rename(&from, &to).await {
                Ok(()) => Done(Response::new().ok(tag, "RENAME completed")),
                Err(MailError::Fatal(e)) => fatal(e),
                Err(e) => Done(completion_for_error(tag, "RENAME", &e)),
            },

            Command::List { reference, pattern } => {
                let names = mailbox.list(&reference, &pattern).await;
                let mut response = Response::new();
                for name in names {
                    response = response.untagged(format!("LIST () \".\" {}", name));
                }
                Done(response.ok(tag, "LIST completed"))
            }

            Command::Append {
                mailbox: name,
                flags,
                size,
            } => match mailbox.append_begin(&name, size, flags).await {
                Ok(pending) => {
                    let selected = self.selected();
                    self.state = State::AppendWait(Box::new(PendingAppend {
                        pending,
                        tag: tag.to_string(),
                        selected,
                    }));
                    CommandOutcome::AwaitLiteral(size)
                }
                Err(MailError::Fatal(e)) => fatal(e),
                Err(e) => Done(completion_for_error(tag, "APPEND", &e)),
            },

            Command::Expunge => {
                let selected = match self.selected() {
                    Some(s) => s,
                    None => {
                        return Done(Response::new().bad(tag, "Please select a mailbox first"))
                    }
                };
                match mailbox.expunge(&selected).await {
                    Ok(seqs) => {
                        let mut response = Response::new();
                        for seq in seqs {
                            response = response.untagged(format!("{} EXPUNGE", seq));
                        }
                        Done(response.ok(tag, "EXPUNGE completed"))
                    }
                    Err(MailError::Fatal(e)) => fatal(e),
                    Err(e) => Done(completion_for_error(tag, "EXPUNGE", &e)),
                }
            }

            Command::Store {
                seqset,
                operator,
                silent,
                flags,
            } => {
                let selected = match self.selected() {
                    Some(s) => s,
                    None => {
                        return Done(Response::new().bad(tag, "Please select a mailbox first"))
                    }
                };
                match mailbox.store(&selected, &seqset, operator, &flags).await {
                    Ok(results) => {
                        let mut response = Response::new();
                        if !silent {
                            for (seq, new_flags) in results {
                                response = response.untagged(format!(
                                    "{} FETCH (FLAGS {})",
                                    seq,
                                    pluto_mail::flags::format_flag_list(&new_flags)
                                ));
                            }
                        }
                        Done(response.ok(tag, "STORE completed"))
                    }
                    Err(MailError::Fatal(e)) => fatal(e),
                    Err(e) => Done(completion_for_error(tag, "STORE", &e)),
                }
            }

            Command::Copy {
                seqset,
                mailbox: destination,
            } => {
                let selected = match self.selected() {
                    Some(s) => s,
                    None => {
                        return Done(Response::new().bad(tag, "Please select a mailbox first"))
                    }
                };
                match mailbox.copy(&selected, &seqset, &destination).await {
                    Ok(()) => Done(Response::new().ok(tag, "COPY completed")),
                    Err(MailError::Fatal(e)) => fatal(e),
                    Err(e) => Done(completion_for_error(tag, "COPY", &e)),
                }
            }
        }
    }

    /// Second half of APPEND: the literal bytes arrived.
    pub async fn append_literal(
        &mut self,
        mailbox: &Arc<UserMailbox>,
        mail: &[u8],
    ) -> CommandOutcome {
        let state = std::mem::replace(&mut self.state, State::Authenticated);
        let wait = match state {
            State::AppendWait(wait) => wait,
            other => {
                self.state = other;
                return CommandOutcome::Done(
                    Response::new().bad("*", "No APPEND in progress"),
                );
            }
        };

        self.state = match &wait.selected {
            Some(selected) => State::Mailbox {
                selected: selected.clone(),
            },
            None => State::Authenticated,
        };

        match mailbox.append_end(wait.pending, mail).await {
            Ok(()) => CommandOutcome::Done(Response::new().ok(&wait.tag, "APPEND completed")),
            Err(MailError::Fatal(e)) => fatal(e),
            Err(e) => CommandOutcome::Done(completion_for_error(&wait.tag, "APPEND", &e)),
        }
    }

    /// The client vanished between the two halves of APPEND.
    pub fn append_abort(&mut self) {
        let state = std::mem::replace(&mut self.state, State::Authenticated);
        if let State::AppendWait(wait) = state {
            // Dropping the pending append releases the user write lock
            self.state = match &wait.selected {
                Some(selected) => State::Mailbox {
                    selected: selected.clone(),
                },
                None => State::Authenticated,
            };
        } else {
            self.state = state;
        }
    }

    pub fn is_logout(&self) -> bool {
        matches!(self.state, State::Logout)
    }
}
