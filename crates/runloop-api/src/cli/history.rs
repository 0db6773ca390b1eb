//! Conversation inspection commands: history, threads.

use anyhow::{Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use runloop_core::repository::ConversationPersistence;
use runloop_types::agent::AgentStatus;
use runloop_types::conversation::ConversationMessage;

use crate::state::AppState;

/// Print the chain ending at `message_id`, summary first.
///
/// # Examples
///
/// ```bash
/// runloop history msg_0192f3...
/// runloop history msg_0192f3... --namespace team --json
/// ```
pub async fn history(state: &AppState, namespace: &str, message_id: &str, json: bool) -> Result<()> {
    let store = state.store().await?;
    let chain = store.load_messages(namespace, Some(message_id)).await?;

    if chain.is_empty() {
        bail!("no record '{message_id}' in namespace '{namespace}'");
    }

    if json {
        let out = serde_json::json!({
            "summary": chain.summary,
            "records": chain.records,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Run").fg(Color::White),
        Cell::new("Thread").fg(Color::White),
        Cell::new("Status").fg(Color::White),
        Cell::new("Messages").fg(Color::White),
        Cell::new("Created").fg(Color::White),
    ]);
    for record in &chain.records {
        table.add_row(vec![
            Cell::new(&record.message_id).fg(Color::Cyan),
            Cell::new(&record.thread_id).fg(Color::DarkGrey),
            status_cell(record),
            Cell::new(record.messages.len().to_string()),
            Cell::new(record.created_at.format("%Y-%m-%d %H:%M:%S").to_string()),
        ]);
    }

    println!();
    if let Some(conversation_id) = chain.conversation_id() {
        println!("  Conversation {}", style(conversation_id).cyan().bold());
        println!();
    }
    println!("{table}");
    println!();

    if let Some(summary) = &chain.summary {
        println!(
            "  {} through {}",
            style("summary").magenta().bold(),
            style(&summary.last_summarized_message_id).dim()
        );
        println!("    {}", summary.summary_message.to_text());
        println!();
    }
    for record in &chain.records {
        println!("  {}", style(&record.message_id).cyan());
        for message in &record.messages {
            println!("    {}", message.to_text());
        }
        println!();
    }
    Ok(())
}

/// List the threads of `conversation_id` with their tips.
pub async fn threads(
    state: &AppState,
    namespace: &str,
    conversation_id: &str,
    json: bool,
) -> Result<()> {
    let store = state.store().await?;
    let thread_ids = store.list_threads(namespace, conversation_id).await?;

    let mut rows = Vec::with_capacity(thread_ids.len());
    for thread_id in thread_ids {
        let tip = store.thread_tip(namespace, &thread_id).await?;
        rows.push((thread_id, tip));
    }

    if json {
        let out: Vec<_> = rows
            .iter()
            .map(|(thread_id, tip)| serde_json::json!({"thread_id": thread_id, "tip": tip}))
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!();
        println!(
            "  {} No threads for conversation '{}'.",
            style("i").blue().bold(),
            style(conversation_id).cyan()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_header(vec![
        Cell::new("Thread").fg(Color::White),
        Cell::new("Tip").fg(Color::White),
    ]);
    for (thread_id, tip) in &rows {
        table.add_row(vec![
            Cell::new(thread_id).fg(Color::Cyan),
            Cell::new(tip.as_deref().unwrap_or("-")),
        ]);
    }
    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn status_cell(record: &ConversationMessage) -> Cell {
    match record.run_state().map(|s| AgentStatus::from(s.status())) {
        Some(AgentStatus::Completed) => Cell::new("completed").fg(Color::Green),
        Some(AgentStatus::Paused) => Cell::new("paused").fg(Color::Yellow),
        Some(status) => Cell::new(status.to_string()).fg(Color::Blue),
        None => Cell::new("-").fg(Color::DarkGrey),
    }
}
