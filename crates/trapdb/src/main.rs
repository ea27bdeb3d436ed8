//! Command-line interface for the trapdb debugger.

mod commands;
mod source;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use libtrapdb::maps::ProcMaps;
use libtrapdb::process::{LaunchOptions, ProcessHandle};
use libtrapdb::symbols::DwarfResolver;
use libtrapdb::tracer::Tracer;
use libtrapdb::{PendingSession, RuntimeAddr, Session, StaticAddr, StopCause, StopReport};
use log::{info, warn};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

use crate::commands::Command as ReplCommand;

type DebugSession = Session<ProcessHandle, DwarfResolver>;

/// Top-level argument parser describing the debugger interface.
#[derive(Parser, Debug)]
#[command(name = "trapdb", version, about = "A simple Linux debugger in Rust", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

/// Subcommands exposed by the debugger frontend.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run a program under trapdb control.
    Run {
        prog: String,
        /// Keep address space randomization enabled for the tracee.
        #[arg(long)]
        aslr: bool,
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Attach to an existing process ID.
    Attach { pid: i32 },
    /// Display version information for diagnostics.
    Version,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.cmd {
        Command::Run { prog, aslr, args } => run_program(&prog, &args, aslr),
        Command::Attach { pid } => attach_to_process(pid),
        Command::Version => {
            println!("trapdb {}", libtrapdb::version());
            Ok(())
        }
    }
}

fn run_program(prog: &str, args: &[String], aslr: bool) -> Result<()> {
    info!("Launching {prog} with args {args:?}");
    let resolver =
        DwarfResolver::load(prog).with_context(|| format!("loading symbols from {prog}"))?;
    let options = LaunchOptions {
        disable_aslr: !aslr,
    };
    let handle = ProcessHandle::launch(prog, args, &options)?;
    println!("Started debugging process {}", handle.pid());
    let session = PendingSession::new(handle, resolver, ProcMaps).bootstrap()?;
    repl(session)
}

fn attach_to_process(pid: i32) -> Result<()> {
    info!("Attaching to pid {pid}");
    let exe = format!("/proc/{pid}/exe");
    let resolver =
        DwarfResolver::load(&exe).with_context(|| format!("loading symbols from {exe}"))?;
    let handle = ProcessHandle::attach(pid)?;
    let session = PendingSession::new(handle, resolver, ProcMaps).bootstrap()?;
    repl(session)
}

fn repl(mut session: DebugSession) -> Result<()> {
    let mut editor = DefaultEditor::new()?;
    println!(
        "pid {} ready, symbols from {}, load bias {:#x}",
        session.pid(),
        session.resolver().path().display(),
        session.bias().offset()
    );

    loop {
        let line = match editor.readline("trapdb> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };
        if line.trim().is_empty() {
            continue;
        }
        editor.add_history_entry(line.as_str())?;

        let command = match commands::parse(&line) {
            Ok(command) => command,
            Err(e) => {
                eprintln!("{e:#}");
                continue;
            }
        };
        if command == ReplCommand::Quit {
            break;
        }

        if let Err(e) = execute(&mut session, command) {
            eprintln!("error: {e:#}");
        }
        if !session.is_alive() {
            break;
        }
    }

    Ok(())
}

fn execute(session: &mut DebugSession, command: ReplCommand) -> Result<()> {
    match command {
        ReplCommand::Continue => {
            let report = session.continue_execution()?;
            print_stop(session, &report);
        }
        ReplCommand::Step => {
            let report = session.single_step()?;
            print_stop(session, &report);
        }
        ReplCommand::Break { addr, static_addr } => {
            let runtime = if static_addr {
                session.to_runtime(StaticAddr(addr))
            } else {
                RuntimeAddr(addr)
            };
            let id = session.set_breakpoint(runtime)?;
            println!("Breakpoint {id} at {runtime}");
        }
        ReplCommand::Delete { addr } => session.remove_breakpoint(RuntimeAddr(addr))?,
        ReplCommand::Breakpoints => {
            let mut bps: Vec<_> = session.breakpoints().iter().collect();
            bps.sort_by_key(|bp| bp.id());
            for bp in bps {
                let state = if bp.is_enabled() { "enabled" } else { "disabled" };
                println!(
                    "{} {} (static {}) {state}",
                    bp.id(),
                    bp.address(),
                    session.to_static(bp.address())
                );
            }
        }
        ReplCommand::RegisterDump => {
            for (reg, value) in session.dump_registers()? {
                println!("{:<8} = {value:#018x}", reg.name());
            }
        }
        ReplCommand::RegisterRead(reg) => println!("{:#x}", session.read_register(reg)?),
        ReplCommand::RegisterWrite(reg, value) => session.write_register(reg, value)?,
        ReplCommand::MemoryRead { addr, words } => {
            for i in 0..words as u64 {
                let at = RuntimeAddr(addr.wrapping_add(i * 8));
                println!("{at} {:#018x}", session.read_memory(at)?);
            }
        }
        ReplCommand::MemoryWrite { addr, value } => {
            session.write_memory(RuntimeAddr(addr), value)?
        }
        ReplCommand::Maps => {
            for mapping in session.mappings()? {
                println!("{mapping}");
            }
        }
        ReplCommand::Pc => {
            let pc = session.get_pc()?;
            println!("{pc} (static {})", session.to_static(pc));
        }
        ReplCommand::Quit => {}
    }
    Ok(())
}

fn print_stop(session: &DebugSession, report: &StopReport) {
    let event = &report.event;
    let pc = event.pc.map(|pc| pc.to_string()).unwrap_or_default();

    match event.cause {
        StopCause::BreakpointHit => println!("Hit breakpoint at address {pc}"),
        StopCause::SingleStepTrap => println!("Stepped to {pc}"),
        StopCause::Exited(_) | StopCause::Terminated(_) => {
            println!("Process {} {}", session.pid(), event.cause)
        }
        StopCause::Signaled { .. } | StopCause::Unknown(_) => {
            if event.cause.is_fault() {
                warn!("tracee faulted at {pc}");
            }
            println!("Stopped at {pc}: {}", event.cause)
        }
    }

    match (&report.function, &report.location) {
        (Some(function), Some(location)) => println!("  in {function} at {location}"),
        (None, Some(location)) => println!("  at {location}"),
        (Some(function), None) => println!("  in {function}"),
        (None, None) => {}
    }

    if let Some(location) = &report.location {
        if matches!(
            event.cause,
            StopCause::BreakpointHit | StopCause::SingleStepTrap
        ) {
            source::print(location);
        }
    }
}
