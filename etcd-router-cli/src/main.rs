use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use etcd_router::{CasOutcome, KvNode, LeaseId, PutOptions, RouterConfig};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "etcd-router-cli")]
#[command(about = "etcd router CLI - key-value commands over a failover/sharded pool", long_about = None)]
struct Args {
    /// Router configuration file (YAML)
    #[arg(short = 'c', long, conflicts_with = "endpoint")]
    config: Option<PathBuf>,

    /// Endpoint of one cluster member; repeat for a failover pool
    #[arg(short = 'e', long)]
    endpoint: Vec<String>,

    /// Command to execute (if not in interactive mode)
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

impl Args {
    fn router_config(&self) -> Result<RouterConfig> {
        if let Some(path) = &self.config {
            return RouterConfig::from_file(path)
                .with_context(|| format!("Failed to load {}", path.display()));
        }
        if self.endpoint.is_empty() {
            return Ok(RouterConfig::from_endpoints(["127.0.0.1:2379"]));
        }
        Ok(RouterConfig::from_endpoints(self.endpoint.clone()))
    }
}

struct Session {
    router: Arc<dyn KvNode>,
}

impl Session {
    fn new(router: Arc<dyn KvNode>) -> Self {
        Self { router }
    }

    fn name(&self) -> String {
        self.router.endpoint(None)
    }

    async fn execute_command(&self, command: &str, args: &[String]) -> Result<String> {
        let start = Instant::now();

        let response = match command.to_uppercase().as_str() {
            "GET" => self.cmd_get(args).await?,
            "PUT" | "SET" => self.cmd_put(args).await?,
            "DEL" | "DELETE" => self.cmd_del(args).await?,
            "PUTIF" => self.cmd_put_if(args).await?,
            "DELIF" => self.cmd_del_if(args).await?,
            "LEASE" => self.cmd_lease(args).await?,
            "ENDPOINT" => self.cmd_endpoint(args),
            "HELP" => help_text(),
            _ => return Err(anyhow::anyhow!("Unknown command: {}", command)),
        };

        let elapsed = start.elapsed();
        Ok(format!(
            "{}\n{}",
            response,
            format!("({:.2?})", elapsed).dimmed()
        ))
    }

    async fn cmd_get(&self, args: &[String]) -> Result<String> {
        if args.is_empty() {
            return Err(anyhow::anyhow!("Usage: GET key"));
        }

        let value = self.router.get(&args[0]).await?;
        Ok(format_value(value.as_deref()))
    }

    async fn cmd_put(&self, args: &[String]) -> Result<String> {
        if args.len() < 2 {
            return Err(anyhow::anyhow!("Usage: PUT key value [lease]"));
        }

        let mut options = PutOptions::new();
        if let Some(lease) = args.get(2) {
            options = options.with_lease(parse_lease(lease)?);
        }

        self.router
            .put(&args[0], args[1].as_bytes(), options)
            .await?;
        Ok("OK".green().to_string())
    }

    async fn cmd_del(&self, args: &[String]) -> Result<String> {
        if args.is_empty() {
            return Err(anyhow::anyhow!("Usage: DEL key [key ...]"));
        }

        let mut deleted = 0;
        for key in args {
            if self.router.delete(key).await? {
                deleted += 1;
            }
        }
        Ok(format!("(integer) {}", deleted))
    }

    async fn cmd_put_if(&self, args: &[String]) -> Result<String> {
        if args.len() < 2 {
            return Err(anyhow::anyhow!("Usage: PUTIF key value [expected]"));
        }

        let expected = args.get(2).map(|s| s.as_bytes());
        let outcome = self
            .router
            .put_if(&args[0], args[1].as_bytes(), expected, true)
            .await?;
        Ok(format_outcome(&outcome))
    }

    async fn cmd_del_if(&self, args: &[String]) -> Result<String> {
        if args.is_empty() {
            return Err(anyhow::anyhow!("Usage: DELIF key [expected]"));
        }

        let expected = args.get(1).map(|s| s.as_bytes());
        let outcome = self.router.delete_if(&args[0], expected, true).await?;
        Ok(format_outcome(&outcome))
    }

    async fn cmd_lease(&self, args: &[String]) -> Result<String> {
        let usage = || anyhow::anyhow!("Usage: LEASE GRANT ttl | LEASE REVOKE id | LEASE KEEPALIVE id");
        let (action, value) = match args {
            [action, value, ..] => (action.to_uppercase(), value),
            _ => return Err(usage()),
        };

        match action.as_str() {
            "GRANT" => {
                let ttl: i64 = value
                    .parse()
                    .with_context(|| format!("Invalid TTL: {}", value))?;
                let lease = self.router.grant_lease(ttl).await?;
                Ok(format!("(integer) {}", lease))
            }
            "REVOKE" => {
                self.router.revoke_lease(parse_lease(value)?).await?;
                Ok("OK".green().to_string())
            }
            "KEEPALIVE" => {
                let ttl = self.router.refresh_lease(parse_lease(value)?).await?;
                Ok(format!("(integer) {}", ttl))
            }
            _ => Err(usage()),
        }
    }

    fn cmd_endpoint(&self, args: &[String]) -> String {
        let endpoint = self.router.endpoint(args.first().map(String::as_str));
        format!("\"{}\"", endpoint)
    }
}

fn parse_lease(raw: &str) -> Result<LeaseId> {
    raw.parse()
        .with_context(|| format!("Invalid lease id: {}", raw))
}

fn format_value(value: Option<&[u8]>) -> String {
    match value {
        Some(bytes) => format!("\"{}\"", String::from_utf8_lossy(bytes)),
        None => "(nil)".dimmed().to_string(),
    }
}

fn format_outcome(outcome: &CasOutcome) -> String {
    match outcome {
        CasOutcome::Applied => "OK".green().to_string(),
        CasOutcome::Rejected => "(rejected)".yellow().to_string(),
        CasOutcome::RejectedWithCurrent(current) => format!(
            "{} current: {}",
            "(rejected)".yellow(),
            format_value(current.as_deref())
        ),
    }
}

fn help_text() -> String {
    format!(
        r#"{}

{}
  GET key                    Get the value of key
  PUT key value [lease]      Set key, optionally attached to a lease
  DEL key [key ...]          Delete one or more keys

{}
  PUTIF key value [expected] Set key only if it holds expected (absent if omitted)
  DELIF key [expected]       Delete key only if it holds expected (absent if omitted)

{}
  LEASE GRANT ttl            Grant a lease living ttl seconds
  LEASE REVOKE id            Revoke a lease and delete its keys
  LEASE KEEPALIVE id         Refresh a lease

{}
  ENDPOINT [key]             Show the pool, or the node owning key
  HELP                       Show this help message
  QUIT                       Exit the CLI
"#,
        "etcd router CLI - Available Commands".bold().cyan(),
        "Basic Commands:".bold(),
        "Conditional Writes:".bold(),
        "Leases:".bold(),
        "Routing:".bold(),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    // CLI output goes through info!; library logs stay at warn unless RUST_LOG says otherwise
    let log_level =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,etcd_router=warn".to_string());
    tracing_subscriber::fmt()
        .with_writer(std::io::stdout)
        .with_env_filter(tracing_subscriber::EnvFilter::new(log_level))
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let args = Args::parse();
    let config = args.router_config()?;
    let router = config.connect().context("Failed to build router")?;
    let session = Session::new(router);

    // Check if running in command mode or interactive mode
    if !args.command.is_empty() {
        let cmd = &args.command[0];
        let cmd_args: Vec<String> = args.command[1..].to_vec();

        match session.execute_command(cmd, &cmd_args).await {
            Ok(output) => {
                info!("{}", output);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "{}", format!("Error: {}", e).red());
                std::process::exit(1);
            }
        }
    } else {
        run_interactive(session).await
    }
}

async fn run_interactive(session: Session) -> Result<()> {
    info!(
        "{}",
        format!("etcd router CLI v{}", env!("CARGO_PKG_VERSION"))
            .bold()
            .cyan()
    );
    info!("Routing over {}", session.name());
    info!("Type {} for available commands\n", "HELP".bold());

    let mut rl = DefaultEditor::new()?;
    let prompt = format!("{}> ", "etcd-router".green());

    loop {
        match rl.readline(&prompt) {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }

                rl.add_history_entry(&line)?;

                let parts: Vec<String> = line.split_whitespace().map(String::from).collect();
                let cmd = &parts[0];
                let args = &parts[1..];

                if cmd.eq_ignore_ascii_case("QUIT") || cmd.eq_ignore_ascii_case("EXIT") {
                    info!("Goodbye!");
                    break;
                }

                match session.execute_command(cmd, args).await {
                    Ok(output) => info!("{}", output),
                    Err(e) => {
                        error!(error = %e, "{}", format!("Error: {}", e).red());
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                info!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                info!("Goodbye!");
                break;
            }
            Err(err) => {
                error!(error = ?err, "Readline error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}
