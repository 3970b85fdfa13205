use std::time::Duration;

use agentplate::tools::Params;
use agentplate::{
    Agent, AgentConfig, AgentMetadata, DataBag, StepError, Task, TaskScope, Workflow, WorkflowContext,
    WorkflowDefinition, WorkflowState,
};
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

/// Files the incoming ticket and stamps it with the host name.
struct Intake {
    dir: std::path::PathBuf,
}

#[async_trait]
impl Task for Intake {
    async fn run(&self, scope: TaskScope<'_>) -> Result<DataBag, StepError> {
        let subject = scope.data.get_as::<String>("subject").unwrap_or_default();
        let path = self.dir.join("ticket.txt");

        let mut write = Params::new();
        write.insert("action".into(), json!("write"));
        write.insert("path".into(), json!(path.display().to_string()));
        write.insert("content".into(), json!(subject));
        scope.execute_tool("filesystem", write).await?;

        let mut host = Params::new();
        host.insert("command".into(), json!("hostname"));
        host.insert("timeout".into(), json!(2_000));
        let host = scope.execute_tool("process", host).await?;

        Ok([
            ("ticketPath", json!(path.display().to_string())),
            ("receivedBy", host.get("stdout").cloned().unwrap_or(Value::Null)),
        ]
        .into_iter()
        .collect())
    }
}

fn triage() -> WorkflowDefinition {
    WorkflowDefinition::new("triage", "classify")
        .state("classify", WorkflowState::invoke("classify", "respond"))
        .state("respond", WorkflowState::invoke("respond", "closed").on_error("escalated"))
        .state("closed", WorkflowState::final_state())
        .state("escalated", WorkflowState::final_state())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("agentplate=debug")))
        .init();

    let dir = tempfile::tempdir()?;
    let seed: DataBag = [("subject", json!("Printer on fire"))].into_iter().collect();
    let config = AgentConfig::new()
        .with_initial_context(seed.clone())
        .with_timeout(Duration::from_secs(5));
    let mut agent = Agent::with_default_tools(config, AgentMetadata::new("intake", "Ticket intake"))
        .with_task(Intake {
            dir: dir.path().to_path_buf(),
        });

    let intake = agent.start().await;
    println!("intake: success={} retries={} data={:?}", intake.success, intake.retries, intake.data);

    let wf = Workflow::new(triage().with_context(seed))?
        .with_step_timeout(Duration::from_secs(2))
        .operation("classify", |ctx: WorkflowContext| async move {
            let subject = ctx.data.get_as::<String>("subject").unwrap_or_default();
            let priority = if subject.to_lowercase().contains("fire") { "p1" } else { "p3" };
            Ok(json!({ "priority": priority }))
        })
        .operation("respond", |ctx: WorkflowContext| async move {
            match ctx.data.get("classify").and_then(|c| c.get("priority")).and_then(Value::as_str) {
                Some("p1") => Err(StepError::failed("p1 tickets need a human")),
                _ => Ok(json!("auto-reply sent")),
            }
        });

    let run = wf
        .run()
        .on_transition(|t| println!("  {} -> {} ({})", t.from, t.to, t.event));
    run.handle().update([("channel", json!("email"))].into_iter().collect());
    let ctx = run.finish().await?;

    println!("triage data: {}", serde_json::to_string_pretty(&ctx.data)?);
    if let Some(error) = ctx.error {
        println!("escalated: {error}");
    }
    Ok(())
}
