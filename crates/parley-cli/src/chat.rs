//! Interactive text chat over a realtime session.

use std::io::Write;
use std::sync::Arc;

use parley_conversation::{Conversation, TranscriptEvent};
use parley_core::config::Config;
use parley_core::types::{Modality, Role};
use parley_session::Session;
use parley_tools::ToolExecutor;
use parley_tools::builtin::register_builtins;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

const HELP: &str = "Commands: /interrupt, /history, /state, /tools, /quit";

pub async fn run(config: &Config, text_only: bool) -> anyhow::Result<()> {
    let executor = ToolExecutor::from_config(&config.tools);
    register_builtins(&executor);
    let conversation = Conversation::new(Session::from_config(config), Arc::new(executor));

    let mut configuration = config.session_configuration();
    if text_only {
        configuration = configuration.with_modalities(vec![Modality::Text]);
    }

    let printer = tokio::spawn(print_transcript(conversation.subscribe_transcript()));
    conversation.start(config.endpoint(), configuration).await?;
    println!("Connected. {HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line {
            "/quit" | "/exit" => break,
            "/interrupt" => conversation.interrupt().await?,
            "/state" => println!("state: {}", conversation.state()),
            "/history" => {
                for message in conversation.messages() {
                    println!(
                        "[{}] {:?}: {}",
                        message.timestamp.format("%H:%M:%S"),
                        message.role,
                        message.text
                    );
                }
            }
            "/tools" => {
                for tool in conversation.executor().available_tools() {
                    println!("{:<16} {}", tool.name, tool.description);
                }
            }
            command if command.starts_with('/') => println!("Unknown command. {HELP}"),
            text => {
                if let Err(e) = conversation.send_text(text).await {
                    eprintln!("error: {e}");
                    if let Some(server) = conversation.last_error() {
                        eprintln!("server: {}", server.message);
                    }
                }
            }
        }
    }

    conversation.end().await;
    printer.abort();
    Ok(())
}

async fn print_transcript(mut events: broadcast::Receiver<TranscriptEvent>) {
    let mut streaming = false;
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Transcript printer lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if event.role != Role::Assistant {
            continue;
        }

        let mut stdout = std::io::stdout().lock();
        if event.is_final {
            if !streaming {
                let _ = write!(stdout, "assistant: {}", event.text);
            }
            let _ = writeln!(stdout);
            streaming = false;
        } else {
            if !streaming {
                let _ = write!(stdout, "assistant: ");
                streaming = true;
            }
            let _ = write!(stdout, "{}", event.text);
        }
        let _ = stdout.flush();
    }
}
