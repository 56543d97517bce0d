use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use crossterm::{
    event::{Event, EventStream, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use futures_util::StreamExt;
use ratatui::{backend::CrosstermBackend, Terminal};
use std::{
    fs::{self, OpenOptions},
    io::{self, Stdout, Write},
    path::Path,
    sync::{Arc, Mutex as StdMutex},
};
use taskdeck_console::{
    ui::{handle_key, render_ui},
    ApiClient, ConfigArgs, Dashboard, PushChannel, PushClient, Settings,
};
use taskdeck_core::{CreateTaskRequest, TaskId, TaskPriority, TaskRecord, TaskStatus};
use taskdeck_engine::AuthContext;
use tracing::{info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "taskdeck")]
#[command(about = "Live dashboard for scheduler tasks", long_about = None)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Command {
    /// Run the live dashboard (default).
    Watch,
    /// Print the current task list once.
    Tasks {
        #[arg(long)]
        json: bool,
    },
    Create(CreateArgs),
    #[command(alias = "status")]
    SetStatus { id: String, status: TaskStatus },
    #[command(alias = "rm")]
    Delete { id: String },
}

#[derive(Args, Debug)]
struct CreateArgs {
    name: String,
    #[arg(long, default_value = "MEDIUM")]
    priority: TaskPriority,
    #[arg(long, default_value_t = 1)]
    threads: u32,
    #[arg(long, default_value = "")]
    command: String,
}

struct LogGuard {
    file: Option<Arc<StdMutex<fs::File>>>,
}

struct MultiWriter {
    stdout_enabled: bool,
    file: Option<Arc<StdMutex<fs::File>>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli.config).context("failed to load configuration")?;
    let _log_guard = init_logging(&settings);

    let auth = settings.auth_context().with_context(|| {
        format!("failed to read token file {}", settings.token_file.display())
    })?;
    let api = ApiClient::new(settings.api_url.clone(), auth.clone())?;

    match cli.command.unwrap_or(Command::Watch) {
        Command::Watch => run_watch(&settings, api, auth).await,
        Command::Tasks { json } => print_tasks(&api, json).await,
        Command::Create(args) => {
            let request = CreateTaskRequest {
                name: args.name,
                priority: args.priority,
                threads_needed: args.threads,
                command: args.command,
            };
            let record = api.create_task(&request).await?;
            print_record(&record);
            Ok(())
        }
        Command::SetStatus { id, status } => {
            let record = api.update_status(&TaskId::new(id), status).await?;
            print_record(&record);
            Ok(())
        }
        Command::Delete { id } => {
            api.delete_task(&TaskId::new(id.clone())).await?;
            println!("deleted {id}");
            Ok(())
        }
    }
}

async fn run_watch(settings: &Settings, api: ApiClient, auth: AuthContext) -> Result<()> {
    let mut dashboard = Dashboard::new(api, settings.reconciler);
    dashboard.start_polling(settings.poll);
    if settings.push_enabled {
        let push = PushClient::new(settings.push_config(), auth.clone());
        dashboard.start_push(&push, &PushChannel::ALL);
    }
    if !auth.is_authenticated() {
        warn!(event = "no_token", token_file = %settings.token_file.display());
        dashboard.set_status_note(format!(
            "no token: write one to {} or set TASKDECK_TOKEN",
            settings.token_file.display()
        ));
    }
    info!(event = "watch_started", api_url = %settings.api_url, push_url = %settings.push_url);

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = event_loop(&mut terminal, &mut dashboard).await;
    dashboard.shutdown().await;

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    result
}

async fn event_loop(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    dashboard: &mut Dashboard,
) -> Result<()> {
    let mut events = EventStream::new();
    loop {
        terminal.draw(|frame| render_ui(frame, dashboard))?;
        tokio::select! {
            Some(event) = dashboard.next_event() => {
                dashboard.handle_event(event);
            }
            maybe_event = events.next() => {
                match maybe_event {
                    Some(Ok(Event::Key(key))) if key.kind == KeyEventKind::Press => {
                        if handle_key(key, dashboard) {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err.into()),
                    None => break,
                }
            }
        }
    }
    Ok(())
}

async fn print_tasks(api: &ApiClient, json: bool) -> Result<()> {
    let report = api.fetch_tasks().await?;
    for err in &report.errors {
        warn!(event = "task_dropped", error = %err);
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&report.items)?);
        return Ok(());
    }
    if report.items.is_empty() {
        println!("No tasks.");
        return Ok(());
    }
    for record in &report.items {
        print_record(record);
    }
    Ok(())
}

fn print_record(record: &TaskRecord) {
    println!(
        "{:<10} {:<10} {:<8} {}",
        record.id.as_str(),
        record.status.as_str(),
        record.priority.as_str(),
        record.name
    );
}

fn init_logging(settings: &Settings) -> Option<LogGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone()));
    let writer = match open_log_file(&settings.log_dir) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let stdout_enabled = settings.log_stdout;
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone(), stdout_enabled));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .with_ansi(false)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

impl MultiWriter {
    fn new(file: Option<Arc<StdMutex<fs::File>>>, stdout_enabled: bool) -> Self {
        Self {
            stdout_enabled,
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.stdout_enabled {
            let _ = io::stdout().write_all(buf);
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.stdout_enabled {
            let _ = io::stdout().flush();
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &Path) -> io::Result<LogGuard> {
    if log_dir.as_os_str().is_empty() {
        return Ok(LogGuard { file: None });
    }
    fs::create_dir_all(log_dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("taskdeck.log"))?;
    Ok(LogGuard {
        file: Some(Arc::new(StdMutex::new(file))),
    })
}
