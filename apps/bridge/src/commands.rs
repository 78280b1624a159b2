//! Line-based control commands read from stdin.

/// A parsed control line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Connect with the configured parameters, replacing any live session.
    Connect,
    /// Tear the session down.
    Disconnect,
    /// Switch the subscription without reconnecting.
    Topic(String),
    /// Print the current phase and last relayed message.
    Status,
    Quit,
}

/// Parses one line. Blank lines yield `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let command = match word.to_ascii_lowercase().as_str() {
        "connect" | "reconnect" => Command::Connect,
        "disconnect" => Command::Disconnect,
        "status" => Command::Status,
        "quit" | "exit" => Command::Quit,
        "topic" if rest.is_empty() => return Err("usage: topic <filter>".into()),
        "topic" => Command::Topic(rest.to_owned()),
        other => {
            return Err(format!(
                "unknown command {other:?} (connect, disconnect, topic <filter>, status, quit)"
            ));
        }
    };
    Ok(Some(command))
}
