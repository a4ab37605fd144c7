use super::App;
use crate::output::Output;
use anyhow::{Context, Result};
use herald_core::Envelope;

pub fn send(app: &App, account: Option<&str>, peer: &str, text: &str, output: &Output) -> Result<()> {
    let (pipeline, events) = app.pipeline(account)?;
    let report = pipeline.send_message(peer, text)?;
    while let Ok(event) = events.try_recv() {
        output.event(event);
    }
    output.success("send", report);
    Ok(())
}

pub fn receipt(
    app: &App,
    account: Option<&str>,
    peer: &str,
    kind: &str,
    message_ids: Vec<String>,
    output: &Output,
) -> Result<()> {
    let (pipeline, _events) = app.pipeline(account)?;
    let report = pipeline.send_receipt(peer, kind, message_ids)?;
    if kind == "read" {
        pipeline.mark_read(peer);
    }
    output.success("receipt", report);
    Ok(())
}

pub fn typing(app: &App, account: Option<&str>, peer: &str, output: &Output) -> Result<()> {
    let (pipeline, _events) = app.pipeline(account)?;
    let report = pipeline.send_typing(peer)?;
    output.success("typing", report);
    Ok(())
}

/// Drain the inbox spool: decrypt each envelope, surface its events, and
/// remove the file once handled. A bad envelope is reported and skipped;
/// the rest of the batch still processes.
pub fn receive(
    app: &App,
    account: Option<&str>,
    max_messages: Option<usize>,
    output: &Output,
) -> Result<()> {
    let (pipeline, events) = app.pipeline(account)?;

    let inbox = app.inbox_dir();
    std::fs::create_dir_all(&inbox)?;
    let mut paths: Vec<_> = std::fs::read_dir(&inbox)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut processed = 0usize;
    let mut failed = 0usize;

    for path in paths {
        if let Some(max) = max_messages {
            if processed >= max {
                break;
            }
        }

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let envelope: Result<Envelope, _> = serde_json::from_str(&raw);

        match envelope {
            Ok(envelope) => match pipeline.receive(&envelope) {
                Ok(()) => {
                    processed += 1;
                    std::fs::remove_file(&path)?;
                }
                Err(e) => {
                    failed += 1;
                    output.error(&format!("{}: {}", path.display(), e));
                    std::fs::remove_file(&path)?;
                }
            },
            Err(e) => {
                failed += 1;
                output.error(&format!("{}: not an envelope: {}", path.display(), e));
            }
        }

        while let Ok(event) = events.try_recv() {
            output.event(event);
        }
    }

    output.success(
        "receive",
        serde_json::json!({ "processed": processed, "failed": failed }),
    );
    Ok(())
}
