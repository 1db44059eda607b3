use anyhow::{Context, Result, bail};
use serde_json::Value;
use std::collections::HashSet;
use todoist_sync::{Client, ContextDocument, Entity, Priority, Task, TaskStore};

use crate::cli::{Command, ContextAction};

pub async fn run(client: &mut Client, command: Command) -> Result<()> {
    let summary = client.sync().await.context("Sync failed")?;
    let mutating = command.is_mutating();

    match command {
        Command::Sync => {
            println!(
                "{} tasks, {} projects ({} removed)",
                summary.tasks, summary.projects, summary.removed
            );
        }
        Command::Tasks { project, all } => {
            let mut tasks: Vec<Task> = client
                .tasks()
                .all()
                .into_iter()
                .filter(|t| all || !t.checked)
                .filter(|t| project.as_deref().is_none_or(|p| t.project_id == p))
                .collect();
            tasks.sort_by(|a, b| {
                (&a.project_id, a.order, &a.id).cmp(&(&b.project_id, b.order, &b.id))
            });
            for task in &tasks {
                println!("{}", format_task(task));
            }
        }
        Command::Projects => {
            let mut projects = client.projects().all();
            projects.sort_by(|a, b| (a.order, &a.id).cmp(&(b.order, &b.id)));
            for project in projects {
                let marker = if project.is_favorite { "*" } else { " " };
                println!("{:>12} {} {}", project.id, marker, project.name);
            }
        }
        Command::Add {
            content,
            project,
            priority,
            labels,
        } => {
            let mut task = Task::new(content).with_labels(labels);
            if let Some(priority) = priority {
                task = task.with_priority(Priority(priority));
            }
            if let Some(project) = project {
                task = task.with_project(project);
            }
            let task = client.add_task(task).await.context("Failed to create task")?;
            if task.is_persisted() {
                println!("{}", task.id);
            } else if let Some(temp_id) = &task.temp_id {
                println!("{} (pending)", temp_id);
            }
        }
        Command::Close { id } => client.close_task(&id).await?,
        Command::Reopen { id } => client.reopen_task(&id).await?,
        Command::Set { id, field, value } => {
            client
                .update_task_field(&id, &field, &value)
                .await
                .with_context(|| format!("Failed to set {} on task {}", field, id))?;
        }
        Command::Label { id, label } => client.add_label(&id, &label).await?,
        Command::Unlabel { id, label } => client.remove_label(&id, &label).await?,
        Command::Tree { id } => {
            let Some(root) = client.tasks().get(&id) else {
                bail!("task not found: {}", id);
            };
            println!("{}", format_task(root));
            let mut visited = HashSet::from([id.clone()]);
            print_subtree(client.tasks(), &id, 1, &mut visited);
        }
        Command::Comments { id } => {
            for comment in client.task_comments(&id).await? {
                println!(
                    "{:>12} {} {}",
                    comment.id,
                    comment.posted_at.as_deref().unwrap_or("-"),
                    comment.content
                );
            }
        }
        Command::Context { action } => run_context(client, action).await?,
    }

    if mutating && client.config().use_sync_api {
        commit(client).await?;
    }
    Ok(())
}

async fn run_context(client: &Client, action: ContextAction) -> Result<()> {
    match action {
        ContextAction::Get { id, key } => {
            let document = client.get_context(&id).await?;
            match key {
                Some(key) => match document.get(&key) {
                    Some(value) => println!("{}", serde_json::to_string_pretty(value)?),
                    None => bail!("no context key {:?} on task {}", key, id),
                },
                None => println!("{}", serde_json::to_string_pretty(&document)?),
            }
        }
        ContextAction::Set { id, key, value } => {
            let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
            let mut partial = ContextDocument::new();
            partial.insert(key, value);
            client.update_context(&id, partial).await?;
        }
        ContextAction::Unset { id, key } => {
            client.delete_context_field(&id, &key).await?;
        }
        ContextAction::Clear { id } => client.delete_context(&id).await?,
    }
    Ok(())
}

async fn commit(client: &mut Client) -> Result<()> {
    let result = client.commit().await.context("Commit failed")?;
    let rejected: Vec<_> = result.rejected().collect();
    for outcome in &rejected {
        eprintln!(
            "rejected {} ({}): {:?}",
            outcome.kind.as_str(),
            outcome.temp_id.as_deref().unwrap_or(&outcome.uuid),
            outcome.status
        );
    }
    for (temp_id, real_id) in &result.temp_id_mapping {
        println!("{} -> {}", temp_id, real_id);
    }
    if !rejected.is_empty() {
        bail!("{} command(s) rejected", rejected.len());
    }
    Ok(())
}

fn format_task(task: &Task) -> String {
    let check = if task.checked { "[x]" } else { "[ ]" };
    let mut line = format!(
        "{:>12} {} {:<8} {}",
        task.key(),
        check,
        task.priority.label(),
        task.content
    );
    if let Some(due) = &task.due {
        line.push_str(&format!(" (due {})", due.date));
    }
    for label in &task.labels {
        line.push_str(&format!(" @{}", label));
    }
    line
}

fn print_subtree(store: &TaskStore, id: &str, depth: usize, visited: &mut HashSet<String>) {
    let mut children = store.children(id);
    children.sort_by_key(|t| t.order);
    for child in children {
        if !visited.insert(child.key().to_string()) {
            continue;
        }
        println!("{}{}", "  ".repeat(depth), format_task(child));
        print_subtree(store, child.key(), depth + 1, visited);
    }
}
