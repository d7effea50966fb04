pub mod db;
pub mod objects;
pub mod reconcile;
pub mod users;

use anyhow::Result;
use colored::*;
use std::path::Path;

pub use db::Database;
pub use objects::{ObjectStore, ObjectStoreConfig, PresignedUpload, UploadTarget};
pub use reconcile::{ReconcilePlan, ReconcileReport, Reconciler};
pub use users::{EventOutcome, PurgedUser, UserChange, UserEvent, UserProfile};

use crate::model::Role;

pub fn init(db_path: &Path) -> Result<Database> {
    let db = Database::open(db_path)?;
    db.initialize()?;
    Ok(db)
}

pub fn show_chats(db_path: &Path, user_id: &str, limit: usize) -> Result<()> {
    let db = init(db_path)?;
    let chats = db.list_chats(user_id, limit)?;

    println!("{}", format!("Chats of {}", user_id).cyan().bold());
    println!("{}", "═".repeat(80).bright_black());

    for chat in chats {
        let time = chat.updated_at.format("%Y-%m-%d %H:%M:%S");
        println!(
            "{} {} {}",
            format!("[{}]", time).bright_black(),
            chat.title.bright_white().bold(),
            format!("({})", chat.id).bright_black()
        );
    }

    Ok(())
}

pub fn show_history(db_path: &Path, user_id: &str, chat_id: &str) -> Result<()> {
    let db = init(db_path)?;
    let Some(chat) = db.get_chat(chat_id, user_id)? else {
        anyhow::bail!("chat {} not found", chat_id);
    };
    let messages = db.load_messages(chat_id, user_id)?;

    println!("{}", chat.title.cyan().bold());
    println!("{}", "═".repeat(80).bright_black());

    for message in messages {
        let time = message.created_at.format("%Y-%m-%d %H:%M:%S%.3f");
        let role = match message.role {
            Role::User => "user".green(),
            Role::Assistant => "assistant".blue(),
            Role::System => "system".yellow(),
        };
        let mut text = message.canonical_text();
        if !message.attachments.is_empty() {
            text.push_str(&format!(" [+{} attachment(s)]", message.attachments.len()));
        }

        println!(
            "{} {} {}",
            format!("[{}]", time).bright_black(),
            role.bold(),
            text.bright_white()
        );
    }

    Ok(())
}
