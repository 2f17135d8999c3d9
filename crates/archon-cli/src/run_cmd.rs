//! `archon run`: execute a plan.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use archon_core::alert::AlertEvaluator;
use archon_core::clock::SystemClock;
use archon_core::handler::{HandlerRegistry, PostboxDispatchConfig, PostboxDispatchHandler};
use archon_core::plan::{Dag, Plan};
use archon_core::scheduler::{Scheduler, SchedulerConfig, SchedulerOutcome};
use archon_core::trace::PlanStatus;
use archon_postbox::PostboxStore;

use crate::config::ArchonConfig;

/// Exit code for a plan outcome, per the CLI contract: 0 success,
/// 2 partial_success, 3 failure, 4 timeout (1 is reserved for
/// validation/usage errors).
pub fn exit_code_for(status: PlanStatus) -> u8 {
    match status {
        PlanStatus::Success => 0,
        PlanStatus::PartialSuccess => 2,
        PlanStatus::Failure => 3,
        PlanStatus::Timeout => 4,
    }
}

/// Options for `archon run`.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub dry_run: bool,
    pub max_concurrent: usize,
    pub log_trace: bool,
    pub alert_policy: Option<std::path::PathBuf>,
    pub partial_success_ok: bool,
}

/// Execute (or dry-run) a plan file. Returns the process exit code.
pub async fn run_plan(
    config: &ArchonConfig,
    plan_path: &Path,
    options: &RunOptions,
) -> Result<u8> {
    let plan = match Plan::load(plan_path) {
        Ok(plan) => plan,
        Err(e) => {
            eprintln!("plan validation failed: {e}");
            return Ok(1);
        }
    };
    let dag = match Dag::build(&plan) {
        Ok(dag) => dag,
        Err(e) => {
            eprintln!("plan validation failed: {e}");
            return Ok(1);
        }
    };

    if options.dry_run {
        print_dag(&plan, &dag);
        return Ok(0);
    }

    let store = PostboxStore::open(&config.postbox_root)?;
    let clock = Arc::new(SystemClock);
    let handler = PostboxDispatchHandler::new(
        store.clone(),
        clock.clone(),
        PostboxDispatchConfig {
            trigger_commands: config.trigger_commands.clone(),
            ..PostboxDispatchConfig::default()
        },
    );
    let registry = Arc::new(HandlerRegistry::with_default(Arc::new(handler)));

    let scheduler_config = SchedulerConfig {
        max_concurrent_tasks: options.max_concurrent,
        plan_timeout: config.plan_timeout,
        partial_success_ok: options.partial_success_ok,
        ..SchedulerConfig::default()
    };
    let mut scheduler = Scheduler::new(
        store,
        registry,
        clock,
        scheduler_config,
        &config.log_dir,
    );

    if let Some(policy_path) = &options.alert_policy {
        match AlertEvaluator::load(policy_path) {
            Ok(alerts) => {
                scheduler = scheduler.with_alerts(Arc::new(alerts));
            }
            Err(e) => {
                eprintln!("alert policy invalid: {e}");
                return Ok(1);
            }
        }
    }

    // Ctrl-C cancels the plan; in-flight tasks are drained and marked.
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupt received, cancelling plan");
            signal_cancel.cancel();
        }
    });

    let outcome = scheduler.run(&plan, &dag, cancel).await?;
    print_summary(&plan, &dag, &outcome);

    if options.log_trace {
        match std::fs::read_to_string(&outcome.trace_path) {
            Ok(trace) => println!("{trace}"),
            Err(e) => eprintln!("failed to read trace file: {e}"),
        }
    }

    Ok(exit_code_for(outcome.status))
}

fn print_dag(plan: &Plan, dag: &Dag) {
    println!("plan {} v{} — {} tasks, {} layers", plan.plan_id, plan.version, plan.tasks.len(), dag.depth());
    for (idx, layer) in dag.layers().iter().enumerate() {
        let ids: Vec<&str> = layer
            .iter()
            .map(|&i| plan.tasks[i].task_id.as_str())
            .collect();
        println!("  layer {idx}: {}", ids.join(", "));
    }
    println!("  critical path: {}", dag.critical_path().join(" -> "));
    println!("  max parallelizable tasks: {}", dag.parallelizable_tasks());
}

fn print_summary(plan: &Plan, dag: &Dag, outcome: &SchedulerOutcome) {
    let summary = &outcome.summary;
    println!("plan {} finished: {}", plan.plan_id, outcome.status);
    println!(
        "  completed={} failed={} timeout={} skipped={} retries={}",
        summary.tasks_completed,
        summary.tasks_failed,
        summary.tasks_timeout,
        summary.tasks_skipped,
        summary.total_retries
    );
    if let Some(avg) = summary.avg_task_score {
        println!("  avg task score: {avg:.3}");
    }
    println!("  duration: {:.1}s", summary.total_duration_sec);
    println!("  parallelism achieved: {:.2}", summary.parallelism_achieved);

    let path_states: Vec<String> = dag
        .critical_path()
        .iter()
        .map(|id| {
            let state = outcome
                .task_states
                .get(id)
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_owned());
            format!("{id}={state}")
        })
        .collect();
    println!("  critical path: {}", path_states.join(" -> "));
    println!("  trace: {}", outcome.trace_path.display());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_the_contract() {
        assert_eq!(exit_code_for(PlanStatus::Success), 0);
        assert_eq!(exit_code_for(PlanStatus::PartialSuccess), 2);
        assert_eq!(exit_code_for(PlanStatus::Failure), 3);
        assert_eq!(exit_code_for(PlanStatus::Timeout), 4);
    }
}
