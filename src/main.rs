use std::sync::Arc;
use std::time::Duration;

use durotask::client::{Client, NewWorkflowOptions, RaiseEventOptions};
use durotask::providers::in_memory::InMemoryTaskHub;
use durotask::runtime::{Registry, RegistryError, Runtime};
use durotask::{ActivityContext, CallActivityOptions, ChildWorkflowOptions, OrchestrationContext, durable_info};

fn build_registry() -> Result<Registry, RegistryError> {
    let mut builder = Registry::builder();
    builder
        .add_activity("Activity1", |ctx: ActivityContext, input: String| async move {
            ctx.trace_info(format!("preparing {input}"));
            Ok(format!("prepared({input})"))
        })?
        .add_activity("Activity2", |_ctx: ActivityContext, input: String| async move {
            Ok(format!("validated({input})"))
        })?
        .add_activity("Activity3", |_ctx: ActivityContext, input: String| async move {
            Ok(format!("shipped({input})"))
        })?
        .add_workflow("ChildWorkflow", |ctx: OrchestrationContext, input: String| async move {
            let shipped: String = ctx
                .call_activity("Activity3", CallActivityOptions::default().raw_input(input))
                .get()
                .await?;
            Ok(shipped)
        })?
        .add_workflow("SimpleWorkflow", |ctx: OrchestrationContext, input: String| async move {
            let prepared: String = ctx
                .call_activity("Activity1", CallActivityOptions::default().raw_input(input))
                .get()
                .await?;
            let validated: String = ctx
                .call_activity("Activity2", CallActivityOptions::default().raw_input(prepared))
                .get()
                .await?;
            durable_info!(ctx, "waiting for approval");
            let approval: String = ctx
                .wait_for_external_event("event", Some(Duration::from_secs(5 * 60)))
                .get()
                .await?;
            let shipped: String = ctx
                .call_child_workflow("ChildWorkflow", ChildWorkflowOptions::default().raw_input(validated))
                .get()
                .await?;
            Ok(format!("{shipped} after {approval}"))
        })?;
    Ok(builder.build())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let hub = Arc::new(InMemoryTaskHub::new());
    let rt = Runtime::start(hub.clone(), build_registry()?).await;
    let client = Client::new(hub);

    let id = client
        .schedule_workflow("SimpleWorkflow", NewWorkflowOptions::default().raw_input("order-1"))
        .await?;
    client.wait_for_start(&id, Duration::from_secs(5)).await?;
    client
        .raise_event(&id, "event", RaiseEventOptions::default().raw_payload("approved"))
        .await?;

    let md = client.wait_for_completion(&id, Duration::from_secs(30)).await?;
    println!("{id}: {} {}", md.runtime_status, md.output.unwrap_or_default());

    rt.shutdown(None).await;
    Ok(())
}
