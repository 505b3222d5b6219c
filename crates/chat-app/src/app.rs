use std::sync::Arc;

use parley_llm::{CompletionError, create_gateway};
use parley_storage::{MemoryStore, SessionGateway, SessionName, SqliteStore, StorageError};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinSet;

use crate::client::ChatClient;
use crate::error::{ChatError, ChatResult, InvalidSessionNameSnafu};
use crate::settings::{AppSettings, SettingsError, SettingsStore, StorageBackend};

const HELP: &str = "\
commands:
  /new [name]     start a chat (timestamped name when omitted)
  /list           list chats, newest first
  /open <name>    switch to a chat
  /delete [name]  delete a chat (the active one when omitted)
  /history        show the active chat
  /help           show this text
  /quit           leave once pending replies arrive
anything else is sent to the active chat";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
    #[snafu(display("failed to prepare settings on `{stage}`: {source}"))]
    Settings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("failed to open session store on `{stage}`: {source}"))]
    OpenStore {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to build completion gateway on `{stage}`: {source}"))]
    Gateway {
        stage: &'static str,
        source: CompletionError,
    },
    #[snafu(display("startup maintenance failed on `{stage}`: {source}"))]
    Maintenance {
        stage: &'static str,
        source: ChatError,
    },
    #[snafu(display("terminal io failed on `{stage}`: {source}"))]
    Terminal {
        stage: &'static str,
        source: std::io::Error,
    },
}

pub type AppResult<T> = Result<T, AppError>;

/// One parsed line of shell input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    New(Option<String>),
    List,
    Open(String),
    Delete(Option<String>),
    History,
    Help,
    Quit,
    Send(String),
    Unknown(String),
    Blank,
}

impl ShellCommand {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Blank;
        }
        let Some(command) = line.strip_prefix('/') else {
            return Self::Send(line.to_string());
        };

        let (verb, argument) = match command.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, Some(rest.trim().to_string())),
            None => (command, None),
        };
        let argument = argument.filter(|value| !value.is_empty());

        match (verb, argument) {
            ("new", name) => Self::New(name),
            ("list", None) => Self::List,
            ("open", Some(name)) => Self::Open(name),
            ("delete", name) => Self::Delete(name),
            ("history", None) => Self::History,
            ("help", None) => Self::Help,
            ("quit" | "exit", None) => Self::Quit,
            _ => Self::Unknown(line.to_string()),
        }
    }
}

type PendingReply = (SessionName, ChatResult<String>);

/// Line-oriented front end over a [`ChatClient`].
///
/// Sends run as background tasks, so switching chats while a reply is pending is safe; the
/// reply lands in the chat it was sent to.
pub struct ChatShell {
    client: Arc<ChatClient>,
}

impl ChatShell {
    pub fn new(client: Arc<ChatClient>) -> Self {
        Self { client }
    }

    pub async fn run<R, W>(&self, input: R, mut output: W) -> AppResult<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        let mut pending: JoinSet<PendingReply> = JoinSet::new();

        write_line(&mut output, "type /help for commands").await?;
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let line = line.context(TerminalSnafu { stage: "read-line" })?;
                    let Some(line) = line else {
                        break;
                    };
                    match ShellCommand::parse(&line) {
                        ShellCommand::Quit => break,
                        ShellCommand::Send(text) => self.spawn_send(&mut pending, &mut output, text).await?,
                        command => {
                            let reply = self.execute(command).await;
                            write_line(&mut output, &reply).await?;
                        }
                    }
                }
                Some(joined) = pending.join_next(), if !pending.is_empty() => {
                    write_reply(&mut output, joined).await?;
                }
            }
        }

        while let Some(joined) = pending.join_next().await {
            write_reply(&mut output, joined).await?;
        }
        output
            .flush()
            .await
            .context(TerminalSnafu { stage: "flush" })
    }

    async fn spawn_send<W>(
        &self,
        pending: &mut JoinSet<PendingReply>,
        output: &mut W,
        text: String,
    ) -> AppResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        let Some(session) = self.client.active_session() else {
            return write_line(output, "no active chat, start one with /new").await;
        };

        let client = Arc::clone(&self.client);
        pending.spawn(async move {
            let result = client.send(&session, &text).await;
            (session, result)
        });
        Ok(())
    }

    async fn execute(&self, command: ShellCommand) -> String {
        let outcome = match command {
            ShellCommand::New(Some(name)) => self.client.create_session(&name).await.map(|name| {
                self.client.set_active_session(Some(name.clone()));
                format!("created chat '{name}'")
            }),
            ShellCommand::New(None) => self
                .client
                .start_chat()
                .await
                .map(|name| format!("created chat '{name}'")),
            ShellCommand::List => self.list().await,
            ShellCommand::Open(name) => self
                .client
                .open_session(&name)
                .await
                .map(|name| format!("switched to '{name}'")),
            ShellCommand::Delete(name) => self.delete(name).await,
            ShellCommand::History => self.history().await,
            ShellCommand::Help => Ok(HELP.to_string()),
            ShellCommand::Unknown(line) => Ok(format!("unknown command '{line}', try /help")),
            ShellCommand::Blank | ShellCommand::Quit | ShellCommand::Send(_) => Ok(String::new()),
        };

        outcome.unwrap_or_else(|error| format!("error: {error}"))
    }

    async fn list(&self) -> ChatResult<String> {
        let sessions = self.client.list_sessions().await?;
        if sessions.is_empty() {
            return Ok("no chats yet".to_string());
        }
        let active = self.client.active_session();
        Ok(sessions
            .iter()
            .map(|name| {
                let marker = if active.as_ref() == Some(name) { '*' } else { ' ' };
                format!("{marker} {name}")
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }

    async fn delete(&self, name: Option<String>) -> ChatResult<String> {
        let target = match name {
            Some(raw) => SessionName::parse(raw).context(InvalidSessionNameSnafu {
                stage: "shell-delete",
            })?,
            None => match self.client.active_session() {
                Some(active) => active,
                None => return Ok("no active chat to delete".to_string()),
            },
        };
        self.client.delete_session(&target).await?;
        Ok(format!("deleted chat '{target}'"))
    }

    async fn history(&self) -> ChatResult<String> {
        let Some(session) = self.client.active_session() else {
            return Ok("no active chat".to_string());
        };
        let messages = self.client.get_messages(&session).await?;
        if messages.is_empty() {
            return Ok(format!("'{session}' has no messages"));
        }
        Ok(messages
            .iter()
            .map(|message| format!("{}: {}", message.role.as_str(), message.content))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

async fn write_line<W>(output: &mut W, text: &str) -> AppResult<()>
where
    W: AsyncWrite + Unpin,
{
    if text.is_empty() {
        return Ok(());
    }
    output
        .write_all(format!("{text}\n").as_bytes())
        .await
        .context(TerminalSnafu {
            stage: "write-line",
        })
}

async fn write_reply<W>(
    output: &mut W,
    joined: Result<PendingReply, tokio::task::JoinError>,
) -> AppResult<()>
where
    W: AsyncWrite + Unpin,
{
    let text = match joined {
        Ok((session, Ok(reply))) => format!("[{session}] assistant: {reply}"),
        Ok((session, Err(error))) => format!("[{session}] error: {error}"),
        Err(error) => {
            tracing::error!(error = %error, "send task ended abnormally");
            format!("error: send task ended abnormally: {error}")
        }
    };
    write_line(output, &text).await
}

/// Builds the configured store backend.
pub async fn open_store(settings: &AppSettings) -> AppResult<Arc<dyn SessionGateway>> {
    match settings.storage.backend {
        StorageBackend::Memory => {
            tracing::info!("using in-memory session store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StorageBackend::Sqlite => {
            let path = settings.storage.database_path();
            let store = SqliteStore::open(&path.to_string_lossy())
                .await
                .context(OpenStoreSnafu {
                    stage: "open-sqlite-store",
                })?;
            Ok(Arc::new(store))
        }
    }
}

/// Wires settings, store and completion gateway into a client, runs startup maintenance,
/// then serves the terminal until input ends.
pub async fn run() -> AppResult<()> {
    let settings_store = SettingsStore::load();
    if settings_store
        .persist_if_missing()
        .context(SettingsSnafu {
            stage: "write-default-settings",
        })?
    {
        tracing::info!(path = %settings_store.config_path().display(), "wrote default settings");
    }
    let settings = settings_store.settings();

    let store = open_store(&settings).await?;
    let completion = create_gateway(settings.completion.to_provider_config()).context(
        GatewaySnafu {
            stage: "create-completion-gateway",
        },
    )?;
    let client = Arc::new(ChatClient::new(
        store,
        completion,
        settings.completion.send_options(),
    ));

    if let Some(max_age) = settings.storage.message_retention() {
        client
            .expire_messages(max_age)
            .await
            .context(MaintenanceSnafu {
                stage: "expire-messages",
            })?;
    }

    ChatShell::new(client)
        .run(tokio::io::BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await
}
