//! Lope CLI: drive the scheduler and virtual memory manager from the
//! command line.

mod report;

use clap::{Parser as ClapParser, Subcommand};
use crossbeam_channel::RecvTimeoutError;
use lope_runtime::{
    AccessMode, LopeConfig, ProcessBridge, ProcessId, Scheduler, SchedulerEvent,
    VirtualMemoryManager,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ANSI color helpers
fn green(s: &str) -> String {
    format!("\x1b[32m{}\x1b[0m", s)
}
fn red(s: &str) -> String {
    format!("\x1b[31m{}\x1b[0m", s)
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{}\x1b[0m", s)
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{}\x1b[0m", s)
}
fn gray(s: &str) -> String {
    format!("\x1b[90m{}\x1b[0m", s)
}
fn status_label(label: &str) -> String {
    format!("\x1b[1;32m{:>12}\x1b[0m", label)
}

#[derive(ClapParser)]
#[command(
    name = "lope",
    version,
    about = "Cooperative process scheduler with priority aging and a paged VMM"
)]
struct Cli {
    /// Path to lope.toml (default: search the current directory and its ancestors)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log scheduler and VMM transitions (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run command lines as tracked OS processes
    Exec {
        /// Run every line in the background and reap them afterwards
        #[arg(long)]
        bg: bool,

        /// Sort the process table by pid
        #[arg(long)]
        sort_pid: bool,

        /// Command lines, e.g. "ls -la" "sleep 1"
        #[arg(required = true)]
        lines: Vec<String>,
    },
    /// Schedule synthetic processes and stream every transition
    Simulate {
        /// Number of synthetic processes
        #[arg(long, default_value_t = 8)]
        procs: u32,

        /// How long to let the scheduler run
        #[arg(long, default_value_t = 2000)]
        duration_ms: u64,

        /// Seed for the I/O draws (overrides the config file)
        #[arg(long)]
        seed: Option<u64>,

        /// Sort the process table by pid
        #[arg(long)]
        sort_pid: bool,

        /// Only print the final report
        #[arg(long, short)]
        quiet: bool,
    },
    /// Fault in more pages than there are frames to show FIFO eviction
    Fillmem {
        /// Pages to touch
        #[arg(long, default_value_t = 20)]
        pages: usize,
    },
    /// Show configuration and empty scheduler/VMM reports
    Status {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Create a lope.toml template in the current directory
    Init,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Init => cmd_init(),
        Commands::Exec {
            bg,
            sort_pid,
            lines,
        } => cmd_exec(load_config(config), &lines, bg, sort_pid),
        Commands::Simulate {
            procs,
            duration_ms,
            seed,
            sort_pid,
            quiet,
        } => cmd_simulate(load_config(config), procs, duration_ms, seed, sort_pid, quiet),
        Commands::Fillmem { pages } => cmd_fillmem(&load_config(config), pages),
        Commands::Status { json } => cmd_status(load_config(config), json),
    }
}

fn load_config(path: Option<&Path>) -> LopeConfig {
    let cfg = LopeConfig::load(path).unwrap_or_else(|e| {
        eprintln!("{} {}", red("error:"), e);
        std::process::exit(1);
    });
    tracing::debug!(?cfg, "configuration loaded");
    cfg
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("lope_runtime=debug,lope=debug"),
        _ => EnvFilter::new("lope_runtime=trace,lope=trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn start_scheduler(cfg: LopeConfig) -> Scheduler {
    let mut sched = Scheduler::new(cfg);
    if let Err(e) = sched.start() {
        eprintln!("{} {}", red("error:"), e);
        std::process::exit(1);
    }
    sched
}

// ---------------------------------------------------------------------------
// exec
// ---------------------------------------------------------------------------

fn cmd_exec(cfg: LopeConfig, lines: &[String], background: bool, sort_pid: bool) {
    let mut bridge = ProcessBridge::new(start_scheduler(cfg));
    let mut failed = false;

    for line in lines {
        match bridge.launch(line, background) {
            Ok(out) => {
                for job in &out.reaped {
                    println!(
                        "{} [{}] {} ({})",
                        status_label("Done"),
                        job.pid.as_u32(),
                        job.command,
                        job.status
                    );
                }
                if let Err(e) = &out.registration {
                    eprintln!("{} {} runs untracked: {}", yellow("warning:"), out.pid, e);
                }
                match (out.status, &out.report) {
                    (Some(status), report) => {
                        let label = if status.success() {
                            green("ok")
                        } else {
                            red(&status.to_string())
                        };
                        let timing = report
                            .as_ref()
                            .map(|r| {
                                format!(
                                    " cpu {}ms, wait {}ms, turnaround {}ms",
                                    r.cpu_time_us / 1000,
                                    r.wait_time_us / 1000,
                                    r.turnaround_us / 1000
                                )
                            })
                            .unwrap_or_default();
                        println!(
                            "{} {} {} {}{}",
                            status_label("Finished"),
                            out.pid.as_u32(),
                            out.command,
                            label,
                            gray(&timing)
                        );
                    }
                    (None, _) => {
                        println!(
                            "{} [{}] {}",
                            status_label("Background"),
                            out.pid.as_u32(),
                            out.command
                        );
                    }
                }
            }
            Err(e) => {
                eprintln!("{} {}", red("error:"), e);
                failed = true;
            }
        }
    }

    if background {
        print!("{}", report::process_table(&bridge.scheduler().snapshot(), true, sort_pid));
        for job in bridge.wait_background() {
            println!(
                "{} [{}] {} ({})",
                status_label("Done"),
                job.pid.as_u32(),
                job.command,
                job.status
            );
        }
    }

    bridge.shutdown();
    let sched = bridge.scheduler();
    let snap = sched.snapshot();
    print!("{}", report::process_table(&snap, true, sort_pid));
    print!("{}", report::scheduler_stats(&snap, sched.config()));
    print!("{}", report::vmm_status(&sched.vmm_status()));

    if failed {
        std::process::exit(1);
    }
}

// ---------------------------------------------------------------------------
// simulate
// ---------------------------------------------------------------------------

const SIMULATED_COMMANDS: &[&str] = &["ls", "whoami", "who", "pwd", "date", "ps", "cat", "sleep"];
const FIRST_SIMULATED_PID: u32 = 10_000;

fn cmd_simulate(
    mut cfg: LopeConfig,
    procs: u32,
    duration_ms: u64,
    seed: Option<u64>,
    sort_pid: bool,
    quiet: bool,
) {
    if seed.is_some() {
        cfg.scheduler.seed = seed;
    }
    let page_size = cfg.vmm.page_size;
    let mut sched = start_scheduler(cfg);
    let events = sched.subscribe();

    // Even-numbered processes exit part-way through; the rest are still
    // tracked when the report is printed.
    let duration = Duration::from_millis(duration_ms);
    let mut exits: Vec<(Duration, ProcessId)> = Vec::new();
    let mut pages: HashMap<ProcessId, usize> = HashMap::new();
    for i in 0..procs {
        let pid = ProcessId::new(FIRST_SIMULATED_PID + i);
        let command = SIMULATED_COMMANDS[i as usize % SIMULATED_COMMANDS.len()];
        if let Err(e) = sched.spawn_request(command, pid) {
            eprintln!("{} {}", yellow("warning:"), e);
            continue;
        }
        let bytes = sched.memory_profile().bytes_for(command);
        pages.insert(pid, bytes.div_ceil(page_size.max(1)) as usize);
        if i % 2 == 0 {
            exits.push((duration * (i + 1) / (procs + 1), pid));
        }
    }

    let started = Instant::now();
    let mut touches: HashMap<ProcessId, usize> = HashMap::new();
    while started.elapsed() < duration {
        while let Some(&(at, pid)) = exits.first() {
            if started.elapsed() < at {
                break;
            }
            exits.remove(0);
            sched.finalize(pid);
        }

        match events.recv_timeout(Duration::from_millis(10)) {
            Ok(event) => {
                if !quiet {
                    println!(
                        "{} {}",
                        gray(&format!("[{:>6}ms]", started.elapsed().as_millis())),
                        event
                    );
                }
                // A dispatched process touches its next page.
                if let SchedulerEvent::Dispatched { pid, .. } = event {
                    let Some(&count) = pages.get(&pid).filter(|n| **n > 0) else {
                        continue;
                    };
                    let n = touches.entry(pid).or_default();
                    let mode = if *n % 3 == 2 {
                        AccessMode::Write
                    } else {
                        AccessMode::Read
                    };
                    if let Err(e) = sched.access(pid, *n % count, mode) {
                        eprintln!("{} {}", yellow("warning:"), e);
                    }
                    *n += 1;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let snap = sched.snapshot();
    print!("{}", report::process_table(&snap, true, sort_pid));
    print!("{}", report::vmm_status(&sched.vmm_status()));

    for pcb in snap.processes() {
        sched.finalize(pcb.pid());
    }
    sched.shutdown();
    print!("{}", report::scheduler_stats(&sched.snapshot(), sched.config()));
}

// ---------------------------------------------------------------------------
// fillmem
// ---------------------------------------------------------------------------

fn cmd_fillmem(cfg: &LopeConfig, pages: usize) {
    let mut vm = VirtualMemoryManager::new(cfg.vmm.clone());
    let pid = ProcessId::new(9999);

    println!("VMM: Filling memory to demonstrate FIFO eviction...");
    if let Err(e) = vm.allocate(pid, pages as u64 * cfg.vmm.page_size) {
        eprintln!("{} {}", red("error:"), e);
        std::process::exit(1);
    }

    for page in 0..pages {
        match vm.fault(pid, page) {
            Ok(out) => {
                let mut line = format!("VMM: Accessing page {} -> frame {}", page, out.frame);
                if let Some(ev) = out.evicted {
                    line.push_str(&format!(
                        " (evicted PID={} page {} loaded at {})",
                        ev.victim.pid.as_u32(),
                        ev.victim.page,
                        ev.load_time
                    ));
                }
                println!("{}", line);
            }
            Err(e) => {
                eprintln!("{} {}", red("error:"), e);
                std::process::exit(1);
            }
        }
        if page % 5 == 4 {
            println!("{}", cyan(&format!("--- Frame status after page {} ---", page)));
            print!("{}", report::frame_table(&vm.status()));
            println!("{}", cyan("-------------------------------"));
        }
    }

    vm.deallocate(pid);
    print!("{}", report::vmm_status(&vm.status()));
}

// ---------------------------------------------------------------------------
// status / init
// ---------------------------------------------------------------------------

fn cmd_status(cfg: LopeConfig, json: bool) {
    let sched = Scheduler::new(cfg);
    let snap = sched.snapshot();
    let vmm = sched.vmm_status();

    if json {
        let doc = serde_json::json!({
            "config": sched.config(),
            "scheduler": snap,
            "vmm": vmm,
        });
        match serde_json::to_string_pretty(&doc) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("{} {}", red("error:"), e);
                std::process::exit(1);
            }
        }
        return;
    }

    print!("{}", report::config_summary(sched.config()));
    print!("{}", report::scheduler_stats(&snap, sched.config()));
    print!("{}", report::vmm_status(&vmm));
}

fn cmd_init() {
    let path = PathBuf::from(lope_runtime::config::CONFIG_FILE_NAME);
    if path.exists() {
        eprintln!("{} lope.toml already exists, not overwriting", red("error:"));
        std::process::exit(1);
    }
    std::fs::write(&path, LopeConfig::default_template()).unwrap_or_else(|e| {
        eprintln!("{} writing lope.toml: {}", red("error:"), e);
        std::process::exit(1);
    });
    println!("{} lope.toml", status_label("Created"));
}
