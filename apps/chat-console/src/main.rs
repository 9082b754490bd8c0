mod attachment;
mod commands;
mod config;
mod logging;
mod login_memory;
mod render;
mod state;

use std::{process::ExitCode, sync::Arc};

use chat_core::{
    EventStream, RemotePort, SessionContext, SyncCommand, SyncEvent, SyncRuntimeHandle,
    spawn_runtime,
};
use chat_hosted::{AuthStateChange, HostedClient, HostedConfig, Registration};
use chat_platform::{CredentialStore, ScopedCredentialStore};
use commands::{ConsoleCommand, HELP, parse_line};
use config::ConsoleConfig;
use login_memory::LoginMemory;
use state::ConsoleState;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast,
};
use tracing::{debug, error, info, warn};

const CREDENTIAL_SERVICE: &str = "chat-console";

type Store = Arc<dyn CredentialStore>;

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    info!("starting chat-console");

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "chat-console failed");
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

/// Runtime of the signed-in user.
struct ActiveSession {
    user_id: String,
    handle: SyncRuntimeHandle,
    events: EventStream,
}

enum Step {
    Line(std::io::Result<Option<String>>),
    Event(Option<SyncEvent>),
    Auth(Result<AuthStateChange, broadcast::error::RecvError>),
}

enum Flow {
    Continue,
    Quit,
}

struct App {
    config: ConsoleConfig,
    client: HostedClient<Store>,
    logins: LoginMemory<Store>,
    state: ConsoleState,
    session: Option<ActiveSession>,
}

async fn run() -> Result<(), String> {
    let config = ConsoleConfig::from_env().map_err(|err| err.to_string())?;
    let hosted = HostedConfig::from_env().map_err(|err| err.to_string())?;
    let store = ScopedCredentialStore::new(credential_store(&config), CREDENTIAL_SERVICE);
    let logins = LoginMemory::new(store.clone());
    let client = HostedClient::new(hosted, store).map_err(|err| err.to_string())?;
    let mut auth_changes = client.sessions.on_auth_state_change();

    let mut app = App {
        config,
        client,
        logins,
        state: ConsoleState::new(),
        session: None,
    };

    match app.client.sessions.restore() {
        Ok(Some(session)) => println!("restored session for {}", session.email),
        Ok(None) => println!("sign in with /login or create an account with /register (/help)"),
        Err(err) => {
            warn!(error = %err, "session restore failed");
            println!("could not restore the previous session ({}); please /login", err.code);
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let step = tokio::select! {
            line = lines.next_line() => Step::Line(line),
            event = next_event(&mut app.session) => Step::Event(event),
            change = auth_changes.recv() => Step::Auth(change),
        };

        match step {
            Step::Line(Ok(Some(line))) => match parse_line(&line) {
                Ok(Some(command)) => {
                    if let Flow::Quit = app.handle(command).await {
                        break;
                    }
                }
                Ok(None) => {}
                Err(message) => println!("{message}"),
            },
            Step::Line(Ok(None)) => break,
            Step::Line(Err(err)) => {
                app.stop_runtime().await;
                return Err(format!("failed reading stdin: {err}"));
            }
            Step::Event(Some(event)) => app.print(event),
            Step::Event(None) => {
                debug!("runtime event stream closed");
                app.session = None;
            }
            Step::Auth(Ok(change)) => app.on_auth_change(change).await,
            Step::Auth(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                warn!(skipped, "auth state changes lagged");
            }
            Step::Auth(Err(broadcast::error::RecvError::Closed)) => break,
        }
    }

    app.stop_runtime().await;
    Ok(())
}

#[cfg(feature = "os-keyring")]
fn credential_store(_config: &ConsoleConfig) -> Store {
    Arc::new(chat_platform::OsKeyringCredentialStore)
}

#[cfg(not(feature = "os-keyring"))]
fn credential_store(config: &ConsoleConfig) -> Store {
    Arc::new(chat_platform::FileCredentialStore::new(config.credentials_path()))
}

/// Next event of the active runtime; pends forever while signed out.
async fn next_event(session: &mut Option<ActiveSession>) -> Option<SyncEvent> {
    let Some(session) = session else {
        return std::future::pending().await;
    };
    session.events.next().await
}

impl App {
    fn print(&mut self, event: SyncEvent) {
        for line in self.state.apply(event) {
            println!("{line}");
        }
    }

    async fn on_auth_change(&mut self, change: AuthStateChange) {
        match change {
            AuthStateChange::SignedIn(session) => {
                if self.session.as_ref().map(|s| s.user_id.as_str()) == Some(session.user_id.as_str()) {
                    return;
                }
                self.stop_runtime().await;
                let port: Arc<dyn RemotePort> = self.client.backend.clone();
                let handle = spawn_runtime(
                    port,
                    SessionContext::new(session.user_id.clone()),
                    self.config.engine_config(),
                );
                let events = handle.subscribe();
                info!(user_id = %session.user_id, "sync runtime started");
                println!("signed in as {}", session.email);
                self.session = Some(ActiveSession {
                    user_id: session.user_id,
                    handle,
                    events,
                });
            }
            AuthStateChange::SignedOut => {
                self.stop_runtime().await;
                println!("signed out");
            }
        }
    }

    async fn stop_runtime(&mut self) {
        if let Some(session) = self.session.take() {
            if session.handle.send(SyncCommand::Teardown).await.is_err() {
                debug!("runtime already stopped");
            }
            self.state = ConsoleState::new();
        }
    }

    async fn send(&self, command: SyncCommand) {
        let Some(session) = &self.session else {
            println!("sign in first (/login)");
            return;
        };
        if let Err(err) = session.handle.send(command).await {
            println!("! {err}");
        }
    }

    fn user_id(&self) -> Option<String> {
        self.session.as_ref().map(|session| session.user_id.clone())
    }

    async fn handle(&mut self, command: ConsoleCommand) -> Flow {
        match command {
            ConsoleCommand::Help => println!("{HELP}"),
            ConsoleCommand::Quit => return Flow::Quit,
            ConsoleCommand::Login { email, password } => self.login(email, password).await,
            ConsoleCommand::Register {
                username,
                email,
                password,
                avatar,
            } => {
                let avatar = match attachment::load_attachment(avatar, self.config.attachment_limits()).await {
                    Ok(avatar) => avatar,
                    Err(message) => {
                        println!("! {message}");
                        return Flow::Continue;
                    }
                };
                let registration = Registration {
                    username,
                    email: email.clone(),
                    password,
                    avatar: Some(avatar),
                };
                match self.client.accounts.register(&registration).await {
                    Ok(row) => {
                        println!("account created for {}", row.username);
                        self.remember_email(&email);
                    }
                    Err(err) => println!("! {}: {}", err.code, err.message),
                }
            }
            ConsoleCommand::Logout { forget } => {
                if let Err(err) = self.client.sessions.sign_out().await {
                    println!("! sign-out: {}", err.message);
                }
                if forget && let Err(err) = self.logins.forget() {
                    warn!(error = %err, "failed clearing remembered login");
                }
            }
            ConsoleCommand::List { filter } => {
                for line in self.state.list_lines(&filter) {
                    println!("{line}");
                }
            }
            ConsoleCommand::Open(target) => match self.state.resolve(&target) {
                Ok(conversation_id) => {
                    self.send(SyncCommand::OpenConversation { conversation_id })
                        .await
                }
                Err(message) => println!("{message}"),
            },
            ConsoleCommand::Close => self.send(SyncCommand::CloseConversation).await,
            ConsoleCommand::Say(text) => {
                if self.state.open_conversation_id().is_none() {
                    println!("open a conversation first (/list, /open)");
                } else if !self.state.can_send() {
                    println!("sending is disabled in this conversation");
                } else {
                    self.send(SyncCommand::SendMessage { text, image: None })
                        .await
                }
            }
            ConsoleCommand::Image { path, caption } => {
                match attachment::load_attachment(path, self.config.attachment_limits()).await {
                    Ok(image) => {
                        self.send(SyncCommand::SendMessage {
                            text: caption,
                            image: Some(image),
                        })
                        .await
                    }
                    Err(message) => println!("! {message}"),
                }
            }
            ConsoleCommand::Retry { client_temp_id } => {
                self.send(SyncCommand::RetrySend { client_temp_id }).await
            }
            ConsoleCommand::Discard { client_temp_id } => {
                self.send(SyncCommand::DiscardFailed { client_temp_id })
                    .await
            }
            ConsoleCommand::Block => self.set_blocked(true).await,
            ConsoleCommand::Unblock => self.set_blocked(false).await,
            ConsoleCommand::Add { username } => self.add(&username).await,
        }
        Flow::Continue
    }

    async fn set_blocked(&self, blocked: bool) {
        if self.state.open_conversation_id().is_none() {
            println!("open a conversation first");
            return;
        }
        self.send(SyncCommand::SetBlocked { blocked }).await;
    }

    async fn login(&mut self, email: Option<String>, password: Option<String>) {
        let Some(email) = email
            .or_else(|| self.config.prefill_email.clone())
            .or_else(|| self.logins.email())
        else {
            println!("usage: /login <email> <password>");
            return;
        };
        let Some(password) = password.or_else(|| self.config.prefill_password.clone()) else {
            println!("usage: /login {email} <password>");
            return;
        };

        match self
            .client
            .sessions
            .sign_in_with_password(&email, &password)
            .await
        {
            Ok(_) => self.remember_email(&email),
            Err(err) => println!("! {}: {}", err.code, err.message),
        }
    }

    fn remember_email(&self, email: &str) {
        if let Err(err) = self.logins.remember(email) {
            warn!(error = %err, "failed remembering login");
        }
    }

    async fn add(&mut self, username: &str) {
        let Some(user_id) = self.user_id() else {
            println!("sign in first (/login)");
            return;
        };
        let peer = match self.client.accounts.find_user_by_username(username).await {
            Ok(Some(peer)) => peer,
            Ok(None) => {
                println!("no user named {username}");
                return;
            }
            Err(err) => {
                println!("! {}: {}", err.code, err.message);
                return;
            }
        };
        match self
            .client
            .accounts
            .start_conversation(&user_id, &peer.user_id)
            .await
        {
            Ok(conversation_id) => {
                self.send(SyncCommand::RefreshList).await;
                self.send(SyncCommand::OpenConversation { conversation_id })
                    .await;
            }
            Err(err) => println!("! {}: {}", err.code, err.message),
        }
    }
}
