//! Launch Tree CLI
//!
//! Usage:
//!   launch_tree launch/default.launch.yaml
//!   launch_tree launch/default.launch.yaml -a ns:=robot1
//!   launch_tree launch/default.launch.yaml --dry-run

use launch_tree::{
    DescriptionSource, Executor, ExecutorConfig, FileSource, LaunchArgs, LaunchContext,
    NodeFailure, OsBackend, PlanBackend,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn report_failures(failures: &[NodeFailure]) {
    if failures.is_empty() {
        return;
    }
    log::warn!("{} actions failed:", failures.len());
    for failure in failures {
        log::warn!("  {}: {}", failure.action, failure.error);
    }
}

#[tokio::main]
async fn main() {
    let args: LaunchArgs = argh::from_env();

    // Initialize logging; RUST_LOG takes precedence over --log-level
    let env = env_logger::Env::default().default_filter_or(args.log_level.to_lowercase());
    env_logger::init_from_env(env);

    let source = Arc::new(FileSource::current_dir());

    // Validate / show-args only look at the root description
    if args.validate || args.show_args {
        let description = match source.load(&args.launch_file) {
            Ok(d) => d,
            Err(e) => {
                log::error!("Failed to load launch file: {}", e);
                std::process::exit(1);
            }
        };

        if args.validate {
            println!("Launch file '{}' is valid", args.launch_file);
            println!("  Version: {}", description.version);
            println!("  Args: {}", description.declared_arguments().len());
            println!("  Actions: {}", description.action_count());
        }

        if args.show_args {
            println!("Arguments (pass arguments as '<name>:=<value>'):");
            for decl in description.declared_arguments() {
                println!();
                println!("    '{}':", decl.name);
                println!(
                    "        {}",
                    decl.description.as_deref().unwrap_or("no description given")
                );
                if !decl.choices.is_empty() {
                    println!("        Valid choices are: {}", decl.choices.join(", "));
                }
                match &decl.default {
                    Some(default) => println!("        (default: '{}')", default),
                    None => println!("        (required)"),
                }
            }
        }
        return;
    }

    let context = LaunchContext::from_arguments(args.arg_overrides());
    let executor_config = ExecutorConfig {
        shutdown_timeout: Duration::from_millis(args.shutdown_timeout_ms),
    };

    // Dry run mode
    if args.dry_run {
        let mut executor = Executor::new(source, Arc::new(PlanBackend::new()), executor_config);
        if let Err(e) = executor.run(&args.launch_file, context) {
            log::error!("Failed to generate launch plan: {}", e);
            std::process::exit(1);
        }

        let plan = executor.plan();
        if args.json {
            match serde_json::to_string_pretty(&plan) {
                Ok(json) => println!("{}", json),
                Err(e) => {
                    log::error!("Failed to serialize launch plan: {}", e);
                    std::process::exit(1);
                }
            }
        } else {
            println!("{}", plan);
        }
        return;
    }

    let mut executor = Executor::new(source, Arc::new(OsBackend::new()), executor_config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(());

    // Set up Ctrl+C handler
    {
        let shutdown_tx = shutdown_tx.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            log::info!("Received Ctrl+C, initiating shutdown...");
            let _ = shutdown_tx.send(());
        }) {
            log::error!("Error setting Ctrl+C handler: {}", e);
            std::process::exit(1);
        }
    }

    // Walk the launch tree
    if let Err(e) = executor.run(&args.launch_file, context) {
        log::error!("Launch failed: {}", e);
        report_failures(executor.failures());
        executor.shutdown().await;
        std::process::exit(1);
    }

    // Dispatch events until shutdown or all processes exit
    let result = executor.wait(shutdown_rx).await;

    // Shutdown all processes
    executor.shutdown().await;
    report_failures(executor.failures());

    if let Err(e) = result {
        log::error!("Launch aborted: {}", e);
        std::process::exit(1);
    }

    log::info!("Launch tree exiting");
}
