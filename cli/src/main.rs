use std::io::{self, BufRead, Write};

use clap::{Parser, Subcommand, ValueEnum};
use reqwest::{Method, Url};
use serde_json::{Value, json};

const SESSIONS: &[&str] = &["api", "assistant", "sessions"];

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned HTTP {status}: {message}")]
    ServerError { status: u16, message: String },
    #[error("missing expected field `{0}`")]
    MissingField(&'static str),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("terminal i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("invalid base url `{0}`")]
    InvalidBaseUrl(String),
}

#[derive(Parser, Debug)]
#[command(name = "assistant-cli", about = "Manufacturing assistant API CLI")]
struct Cli {
    #[arg(long, env = "MANUFACTURE_AI_URL", default_value = "http://127.0.0.1:3000")]
    base_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Keyword,
    Generation,
}

impl Mode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Keyword => "keyword",
            Self::Generation => "generation",
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check the server is up.
    Health,
    /// Ask one question without a session.
    Ask {
        question: String,
        #[arg(long, value_enum)]
        mode: Option<Mode>,
    },
    /// Interactive chat session on stdin.
    Chat {
        #[arg(long, value_enum)]
        mode: Option<Mode>,
    },
    /// Print the production snapshot.
    Snapshot,
    /// Downtime forecast for one machine.
    Downtime { machine: String },
    /// Anomaly reports with recommendations.
    Anomalies,
}

/// What to do with one line of chat input.
#[derive(Debug, PartialEq, Eq)]
enum ChatLine<'a> {
    Skip,
    Quit,
    Send(&'a str),
}

fn classify_chat_line(line: &str) -> ChatLine<'_> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        ChatLine::Skip
    } else if trimmed == "/quit" {
        ChatLine::Quit
    } else {
        ChatLine::Send(trimmed)
    }
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    let base_url = parse_base_url(&cli.base_url)?;
    let client = reqwest::Client::new();

    match cli.command {
        Command::Health => run_health(&client, &base_url).await,
        Command::Ask { question, mode } => {
            let mut body = json!({ "question": question });
            if let Some(mode) = mode {
                body["mode"] = Value::from(mode.as_str());
            }
            let json = api_request(&client, &base_url, Method::POST, &["api", "assistant", "ask"], Some(body)).await?;
            let answer = json.get("answer").and_then(Value::as_str).ok_or(CliError::MissingField("answer"))?;
            println!("{answer}");
            Ok(())
        }
        Command::Chat { mode } => run_chat(&client, &base_url, mode, io::stdin().lock()).await,
        Command::Snapshot => {
            let json = api_request(&client, &base_url, Method::GET, &["api", "snapshot"], None).await?;
            print_json(&json)
        }
        Command::Downtime { machine } => {
            let segments = ["api", "machines", machine.as_str(), "downtime"];
            let json = api_request(&client, &base_url, Method::GET, &segments, None).await?;
            print_json(&json)
        }
        Command::Anomalies => {
            let json = api_request(&client, &base_url, Method::GET, &["api", "anomalies"], None).await?;
            print_json(&json)
        }
    }
}

fn parse_base_url(raw: &str) -> Result<Url, CliError> {
    let url = Url::parse(raw).map_err(|_| CliError::InvalidBaseUrl(raw.to_owned()))?;
    if url.cannot_be_a_base() {
        return Err(CliError::InvalidBaseUrl(raw.to_owned()));
    }
    Ok(url)
}

/// Append percent-encoded path segments to the base URL, keeping any path
/// prefix it already has.
fn endpoint(base_url: &Url, segments: &[&str]) -> Result<Url, CliError> {
    let mut url = base_url.clone();
    url.path_segments_mut()
        .map_err(|()| CliError::InvalidBaseUrl(base_url.to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

async fn run_health(client: &reqwest::Client, base_url: &Url) -> Result<(), CliError> {
    let response = client.get(endpoint(base_url, &["healthz"])?).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(CliError::ServerError { status: status.as_u16(), message: "health check failed".to_owned() });
    }
    println!("ok");
    Ok(())
}

/// Open a session, chat until EOF or `/quit`, then delete the session. The
/// delete runs even when the chat loop fails.
async fn run_chat(
    client: &reqwest::Client,
    base_url: &Url,
    mode: Option<Mode>,
    input: impl BufRead,
) -> Result<(), CliError> {
    let mut body = json!({});
    if let Some(mode) = mode {
        body["mode"] = Value::from(mode.as_str());
    }
    let session = api_request(client, base_url, Method::POST, SESSIONS, Some(body)).await?;
    let session_id = session
        .get("id")
        .and_then(Value::as_str)
        .ok_or(CliError::MissingField("id"))?
        .to_owned();
    let mode = session.get("mode").and_then(Value::as_str).unwrap_or("unknown");
    eprintln!("session {session_id} ({mode}); /quit to exit");

    if let Some(messages) = session.get("messages").and_then(Value::as_array) {
        for message in messages {
            print_message(message);
        }
    }

    let result = chat_loop(client, base_url, &session_id, input).await;

    let mut session_path = SESSIONS.to_vec();
    session_path.push(session_id.as_str());
    let cleanup = api_request(client, base_url, Method::DELETE, &session_path, None).await;
    if let (Err(_), Err(e)) = (&result, &cleanup) {
        eprintln!("failed to end session {session_id}: {e}");
    }
    result.and(cleanup.map(drop))
}

async fn chat_loop(
    client: &reqwest::Client,
    base_url: &Url,
    session_id: &str,
    mut input: impl BufRead,
) -> Result<(), CliError> {
    let mut segments = SESSIONS.to_vec();
    segments.extend([session_id, "messages"]);
    let mut line = String::new();
    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        if input.read_line(&mut line)? == 0 {
            return Ok(());
        }

        let content = match classify_chat_line(&line) {
            ChatLine::Skip => continue,
            ChatLine::Quit => return Ok(()),
            ChatLine::Send(content) => content,
        };

        let outcome =
            api_request(client, base_url, Method::POST, &segments, Some(json!({ "content": content }))).await?;
        let appended = outcome
            .get("appended")
            .and_then(Value::as_array)
            .ok_or(CliError::MissingField("appended"))?;
        // The user's own line is already on screen.
        for message in appended.iter().skip(1) {
            print_message(message);
        }
    }
}

fn print_message(message: &Value) {
    let role = message.get("role").and_then(Value::as_str).unwrap_or("?");
    let content = message.get("content").and_then(Value::as_str).unwrap_or_default();
    println!("[{role}] {content}");
}

async fn api_request(
    client: &reqwest::Client,
    base_url: &Url,
    method: Method,
    segments: &[&str],
    body: Option<Value>,
) -> Result<Value, CliError> {
    let request = client.request(method, endpoint(base_url, segments)?);
    let request = if let Some(json) = body { request.json(&json) } else { request };

    let response = request.send().await?;
    let status = response.status();
    let value = response.json::<Value>().await.unwrap_or(Value::Null);

    if !status.is_success() {
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| value.to_string(), str::to_owned);
        return Err(CliError::ServerError { status: status.as_u16(), message });
    }

    Ok(value)
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
