//! One authenticated connection and what the store knows about its state.

use tracing::{debug, info, warn};

use crate::authenticator::{CredentialProvider, PlainAuthenticator};
use crate::cancel::Cancellable;
use crate::client::{Client, Response};
use crate::command::Command;
use crate::config::StoreConfig;
use crate::conn::{Connection, Connector};
use crate::error::{Error, Result};
use crate::parse::{self, Untagged};
use crate::types::{Capabilities, MailboxStatus, Name, NamespaceEntry};

const LOGIN_ATTEMPTS: usize = 3;

/// A logged-in connection. Whoever holds the session holds the command lock.
#[derive(Debug)]
pub(crate) struct Session {
    pub(crate) client: Client<Connection>,
    pub(crate) capabilities: Capabilities,
    /// The local path of the selected folder.
    pub(crate) selected: Option<String>,
    /// Untagged updates about the selected folder that arrived during commands the folder did
    /// not issue itself.
    unsolicited: Vec<Vec<u8>>,
}

fn is_mailbox_update(line: &[u8]) -> bool {
    matches!(
        parse::parse_untagged(line),
        Ok(Untagged::Exists(_)) | Ok(Untagged::Expunge(_)) | Ok(Untagged::Fetch(_))
    )
}

impl Session {
    pub(crate) fn new(client: Client<Connection>, capabilities: Capabilities) -> Session {
        Session {
            client,
            capabilities,
            selected: None,
            unsolicited: Vec::new(),
        }
    }

    /// Connect, authenticate and learn the server's capabilities.
    pub(crate) fn open(
        config: &StoreConfig,
        connector: &dyn Connector,
        credentials: &dyn CredentialProvider,
        cancel: &Cancellable,
    ) -> Result<Session> {
        cancel.check()?;
        let mut client = connector.connect()?;
        client.set_cancellable(cancel.clone());
        let capabilities = client.capabilities()?;
        authenticate(&mut client, &capabilities, config, credentials)?;
        // servers often advertise more once authenticated
        let capabilities = client.capabilities()?;
        info!(host = %config.host, user = %config.username, "logged in");
        Ok(Session::new(client, capabilities))
    }

    pub(crate) fn has(&self, capability: &str) -> bool {
        self.capabilities.has(capability)
    }

    /// Run a command on behalf of the store rather than a folder. Mailbox updates about the
    /// selected folder are kept for that folder.
    pub(crate) fn run(&mut self, command: &Command) -> Result<Response> {
        let response = self.client.send_command(command)?;
        if self.selected.is_some() {
            self.unsolicited.extend(
                response
                    .untagged
                    .iter()
                    .filter(|l| is_mailbox_update(l))
                    .cloned(),
            );
        }
        Ok(response)
    }

    /// `LIST reference pattern`.
    pub(crate) fn list(&mut self, reference: &str, pattern: &str) -> Result<Vec<Name>> {
        let response = self.run(&Command::new("LIST").mailbox(reference).mailbox(pattern))?;
        Ok(parse::parse_names(&response.untagged))
    }

    /// `LSUB reference pattern`.
    pub(crate) fn lsub(&mut self, reference: &str, pattern: &str) -> Result<Vec<Name>> {
        let response = self.run(&Command::new("LSUB").mailbox(reference).mailbox(pattern))?;
        Ok(parse::parse_names(&response.untagged))
    }

    /// `STATUS` counts for a mailbox that need not be selected.
    pub(crate) fn status(&mut self, mailbox: &str) -> Result<MailboxStatus> {
        let response = self.run(
            &Command::new("STATUS")
                .mailbox(mailbox)
                .atom("(MESSAGES RECENT UNSEEN UIDNEXT UIDVALIDITY)"),
        )?;
        Ok(parse::parse_status(&response.untagged)?)
    }

    /// The personal namespaces.
    pub(crate) fn namespace(&mut self) -> Result<Vec<NamespaceEntry>> {
        let response = self.run(&Command::new("NAMESPACE"))?;
        Ok(parse::parse_namespace(&response.untagged)?)
    }

    pub(crate) fn create(&mut self, mailbox: &str) -> Result<()> {
        self.run(&Command::new("CREATE").mailbox(mailbox)).map(|_| ())
    }

    pub(crate) fn delete(&mut self, mailbox: &str) -> Result<()> {
        self.run(&Command::new("DELETE").mailbox(mailbox)).map(|_| ())
    }

    pub(crate) fn rename(&mut self, current: &str, new: &str) -> Result<()> {
        self.run(&Command::new("RENAME").mailbox(current).mailbox(new))
            .map(|_| ())
    }

    pub(crate) fn subscribe(&mut self, mailbox: &str) -> Result<()> {
        self.run(&Command::new("SUBSCRIBE").mailbox(mailbox)).map(|_| ())
    }

    pub(crate) fn unsubscribe(&mut self, mailbox: &str) -> Result<()> {
        self.run(&Command::new("UNSUBSCRIBE").mailbox(mailbox))
            .map(|_| ())
    }

    /// Hand over the kept updates for the selected folder.
    pub(crate) fn take_unsolicited(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.unsolicited)
    }

    /// Note that another mailbox is now selected. Returns the previously selected folder if it
    /// had unapplied updates, which it can no longer apply by sequence number.
    pub(crate) fn set_selected(&mut self, path: Option<String>) -> Option<String> {
        let stale = if self.unsolicited.is_empty() {
            None
        } else {
            self.selected.clone()
        };
        self.unsolicited.clear();
        self.selected = path;
        stale
    }

    pub(crate) fn logout(mut self) {
        if let Err(e) = self.client.logout() {
            debug!("logout failed: {}", e);
        }
    }
}

fn authenticate(
    client: &mut Client<Connection>,
    capabilities: &Capabilities,
    config: &StoreConfig,
    credentials: &dyn CredentialProvider,
) -> Result<()> {
    let login_disabled = capabilities.has("LOGINDISABLED");
    if login_disabled && !capabilities.has("AUTH=PLAIN") {
        return Err(Error::Authentication(
            "server disables LOGIN and offers no supported mechanism".to_string(),
        ));
    }
    let mut last = String::new();
    for attempt in 0..LOGIN_ATTEMPTS {
        let prompt = if attempt == 0 {
            format!("Password for {} on {}", config.username, config.host)
        } else {
            format!(
                "{}\nPassword for {} on {}",
                last, config.username, config.host
            )
        };
        let password = match credentials.get_password(&prompt) {
            Some(p) => p,
            None => return Err(Error::Authentication("no password available".to_string())),
        };
        let result = if login_disabled {
            let auth = PlainAuthenticator {
                user: &config.username,
                password: &password,
            };
            client.authenticate("PLAIN", &auth).map(|_| ())
        } else {
            client.login(&config.username, &password)
        };
        match result {
            Ok(()) => return Ok(()),
            Err(Error::No(text)) | Err(Error::Bad(text)) => {
                warn!(attempt = attempt + 1, "login rejected: {}", text);
                credentials.forget_password();
                last = text;
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::Authentication(last))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_stream::MockStream;

    fn session(script: &[u8]) -> Session {
        let conn: Connection = Box::new(MockStream::new(script.to_vec()));
        Session::new(Client::new(conn), Capabilities::default())
    }

    #[test]
    fn list_parses_names() {
        let mut session = session(
            b"* LIST (\\HasNoChildren) \".\" \"INBOX.Sent\"\r\n\
              * LIST (\\Noselect \\HasChildren) \".\" \"INBOX.Lists\"\r\n\
              a1 OK LIST completed\r\n",
        );
        let names = session.list("", "INBOX.*").unwrap();
        let found: Vec<&str> = names.iter().map(|n| n.name()).collect();
        assert_eq!(found, vec!["INBOX.Sent", "INBOX.Lists"]);
        assert_eq!(names[0].delimiter(), Some('.'));
    }

    #[test]
    fn status_counts() {
        let mut session = session(
            b"* STATUS \"Archive\" (MESSAGES 12 RECENT 0 UNSEEN 3 UIDNEXT 40 UIDVALIDITY 7)\r\n\
              a1 OK STATUS completed\r\n",
        );
        let status = session.status("Archive").unwrap();
        assert_eq!(status.messages, Some(12));
        assert_eq!(status.unseen, Some(3));
        assert_eq!(status.uid_validity, Some(7));
    }

    #[test]
    fn updates_for_the_selected_folder_are_kept() {
        let mut session = session(
            b"* 4 EXISTS\r\n\
              * 2 EXPUNGE\r\n\
              a1 OK SUBSCRIBE completed\r\n\
              a2 OK RENAME completed\r\n",
        );
        session.selected = Some("INBOX".to_string());
        session.subscribe("Archive").unwrap();
        assert_eq!(
            session.take_unsolicited(),
            vec![b"* 4 EXISTS\r\n".to_vec(), b"* 2 EXPUNGE\r\n".to_vec()]
        );
        session.rename("Old", "New").unwrap();
        assert!(session.take_unsolicited().is_empty());
    }

    #[test]
    fn nothing_is_kept_without_a_selection() {
        let mut session = session(b"* 4 EXISTS\r\na1 OK CREATE completed\r\n");
        session.create("Projects").unwrap();
        assert!(session.take_unsolicited().is_empty());
    }

    #[test]
    fn rejected_delete_carries_the_server_text() {
        let mut session = session(b"a1 NO Mailbox has inferior hierarchical names\r\n");
        match session.delete("Lists") {
            Err(Error::No(text)) => assert_eq!(text, "Mailbox has inferior hierarchical names"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
