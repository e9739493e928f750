//! `tilt task` — Manage the task queue.

use clap::Subcommand;
use tilt_config::AppConfig;
use tilt_core::store::{NewTask, TaskStore};

#[derive(Subcommand)]
pub enum TaskCommand {
    /// Queue a task; each argument is one instruction line
    Add {
        #[arg(required = true)]
        instructions: Vec<String>,

        /// Display label (defaults to the first instruction)
        #[arg(short, long)]
        label: Option<String>,
    },

    /// List every task, oldest first
    List,

    /// Put a task back to pending
    Reset { id: String },
}

pub async fn run(config: AppConfig, command: TaskCommand) -> Result<(), Box<dyn std::error::Error>> {
    let store = tilt_store::open(&config.database.path).await?;

    match command {
        TaskCommand::Add { instructions, label } => {
            let id = store
                .create_task(NewTask {
                    instructions,
                    label,
                    tool_use: None,
                })
                .await?;
            println!("Queued task {id}");
        }
        TaskCommand::List => {
            let tasks = store.list_tasks().await?;
            if tasks.is_empty() {
                println!("No tasks");
            }
            for task in tasks {
                println!(
                    "{:<38} {:<10} {}",
                    task.id,
                    task.status.as_str(),
                    task.label.as_deref().unwrap_or("-")
                );
                if let Some(error) = &task.error {
                    println!("{:<38} error: {error}", "");
                }
            }
        }
        TaskCommand::Reset { id } => {
            if store.reset_task(&id).await? {
                println!("Task {id} reset to pending");
            } else {
                return Err(format!("Task {id} not found").into());
            }
        }
    }

    Ok(())
}
