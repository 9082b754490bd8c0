//! Line command parser.

use std::path::PathBuf;

/// How `/open` names a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenTarget {
    /// 1-based row in the last printed list.
    Row(usize),
    ChatId(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Login {
        email: Option<String>,
        password: Option<String>,
    },
    Register {
        username: String,
        email: String,
        password: String,
        avatar: PathBuf,
    },
    List {
        filter: String,
    },
    Open(OpenTarget),
    Close,
    Image {
        path: PathBuf,
        caption: String,
    },
    Retry {
        client_temp_id: String,
    },
    Discard {
        client_temp_id: String,
    },
    Block,
    Unblock,
    Add {
        username: String,
    },
    Logout {
        /// Also drop the remembered login email.
        forget: bool,
    },
    Quit,
    Help,
    /// Plain text for the open conversation.
    Say(String),
}

pub const HELP: &str = "\
/login [email] [password]            sign in (falls back to CHAT_EMAIL/CHAT_PASSWORD)
/register <user> <email> <pw> <img>  create an account with an avatar image
/list [filter]                       show conversations, filtered by username
/open <n|chatId>                     open a conversation
/close                               close the open conversation
/img <path> [caption]                send an image
/retry <tempId>  /discard <tempId>   retry or drop a failed send
/block  /unblock                     block or unblock the open conversation's peer
/add <username>                      start a conversation
/logout [forget]                     sign out, optionally forgetting the saved email
/quit  /help
anything else                        send text to the open conversation";

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<ConsoleCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(ConsoleCommand::Say(line.to_owned())));
    };

    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (rest, ""),
    };
    let words: Vec<&str> = args.split_whitespace().collect();

    let command = match name {
        "login" => ConsoleCommand::Login {
            email: words.first().map(|w| (*w).to_owned()),
            password: words.get(1).map(|w| (*w).to_owned()),
        },
        "register" => match words.as_slice() {
            [username, email, password, avatar] => ConsoleCommand::Register {
                username: (*username).to_owned(),
                email: (*email).to_owned(),
                password: (*password).to_owned(),
                avatar: PathBuf::from(avatar),
            },
            _ => return Err("usage: /register <username> <email> <password> <avatar>".to_owned()),
        },
        "list" => ConsoleCommand::List {
            filter: args.to_owned(),
        },
        "open" => match words.as_slice() {
            [target] => ConsoleCommand::Open(match target.parse::<usize>() {
                Ok(0) => return Err("rows are numbered from 1".to_owned()),
                Ok(row) => OpenTarget::Row(row),
                Err(_) => OpenTarget::ChatId((*target).to_owned()),
            }),
            _ => return Err("usage: /open <n|chatId>".to_owned()),
        },
        "close" => ConsoleCommand::Close,
        "img" => {
            let (path, caption) = match args.split_once(char::is_whitespace) {
                Some((path, caption)) => (path, caption.trim()),
                None => (args, ""),
            };
            if path.is_empty() {
                return Err("usage: /img <path> [caption]".to_owned());
            }
            ConsoleCommand::Image {
                path: PathBuf::from(path),
                caption: caption.to_owned(),
            }
        }
        "retry" => ConsoleCommand::Retry {
            client_temp_id: single_arg(&words, "/retry <tempId>")?,
        },
        "discard" => ConsoleCommand::Discard {
            client_temp_id: single_arg(&words, "/discard <tempId>")?,
        },
        "block" => ConsoleCommand::Block,
        "unblock" => ConsoleCommand::Unblock,
        "add" => ConsoleCommand::Add {
            username: single_arg(&words, "/add <username>")?,
        },
        "logout" => match words.as_slice() {
            [] => ConsoleCommand::Logout { forget: false },
            ["forget"] => ConsoleCommand::Logout { forget: true },
            _ => return Err("usage: /logout [forget]".to_owned()),
        },
        "quit" | "exit" => ConsoleCommand::Quit,
        "help" => ConsoleCommand::Help,
        other => return Err(format!("unknown command /{other}; try /help")),
    };
    Ok(Some(command))
}

fn single_arg(words: &[&str], usage: &str) -> Result<String, String> {
    match words {
        [value] => Ok((*value).to_owned()),
        _ => Err(format!("usage: {usage}")),
    }
}
