mod cli;

use std::future::Future;
use std::os::unix::process::CommandExt;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use kapsule::color::{color_enabled_stderr, color_enabled_stdout, paint, set_color_mode, CYAN, GRAY, GREEN, RED, YELLOW};
use kapsule::doctor::run_doctor;
use kapsule::operations::{EventPayload, OperationState};
use kapsule::ui::ProgressRenderer;
use kapsule::util::shell_join;
use kapsule::{
    apply_assignment, exit_code_for_error, Backend, ContainerService, ContainerSummary, EnvMap,
    HostUser, IncusClient, KapsuleError, ProcessRunner, ServiceSettings,
};
use serde_json::{Map, Value};
use tokio::sync::broadcast::error::RecvError;

use cli::{Cli, Command};

fn current_uid() -> u32 {
    nix::unistd::getuid().as_raw()
}

fn error_line(msg: &str) {
    kapsule::color::log_error_stderr(color_enabled_stderr(), msg);
}

fn hint_line(msg: &str) {
    eprintln!("{}", paint(color_enabled_stderr(), kapsule::color::BLUE, &format!("→ {msg}")));
}

/// Drive a tracked action while rendering its progress events.
///
/// Failures the tracker already reported are turned into an exit code here so the
/// message is not printed twice.
async fn with_progress<F>(service: &ContainerService, verbose: bool, fut: F) -> kapsule::Result<ExitCode>
where
    F: Future<Output = kapsule::Result<()>>,
{
    let mut events = service.subscribe();
    let renderer = ProgressRenderer::new(color_enabled_stderr(), verbose);
    let mut reported = false;
    let show = |ev: &kapsule::OperationEvent, reported: &mut bool| {
        if matches!(
            ev.payload,
            EventPayload::Completed {
                state: OperationState::Failed,
                ..
            }
        ) {
            *reported = true;
        }
        renderer.print(ev);
    };

    tokio::pin!(fut);
    let result = loop {
        tokio::select! {
            res = &mut fut => break res,
            ev = events.recv() => match ev {
                Ok(ev) => show(&ev, &mut reported),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break (&mut fut).await,
            },
        }
    };
    while let Ok(ev) = events.try_recv() {
        show(&ev, &mut reported);
    }

    match result {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) if reported => Ok(ExitCode::from(exit_code_for_error(&e))),
        Err(e) => Err(e),
    }
}

fn exit_code(e: &anyhow::Error) -> u8 {
    e.downcast_ref::<KapsuleError>()
        .map(exit_code_for_error)
        .unwrap_or(1)
}

fn caller_env() -> EnvMap {
    std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect()
}

fn column_width(lens: impl Iterator<Item = usize>, title: &str) -> usize {
    lens.max().unwrap_or(0).max(title.len())
}

fn print_containers(list: &[ContainerSummary]) {
    let use_color = color_enabled_stdout();
    let created = |c: &ContainerSummary| c.created.chars().take(10).collect::<String>();
    let wn = column_width(list.iter().map(|c| c.name.len()), "NAME");
    let ws = column_width(list.iter().map(|c| c.status.len()), "STATUS");
    let wi = column_width(list.iter().map(|c| c.image.len()), "IMAGE");
    let wm = column_width(list.iter().map(|c| c.mode.as_str().len()), "MODE");

    println!("{:<wn$}  {:<ws$}  {:<wi$}  {:<wm$}  CREATED", "NAME", "STATUS", "IMAGE", "MODE");
    for c in list {
        let status_color = if c.status.eq_ignore_ascii_case("running") { GREEN } else { RED };
        println!(
            "{}  {}  {}  {:<wm$}  {}",
            paint(use_color, CYAN, &format!("{:<wn$}", c.name)),
            paint(use_color, status_color, &format!("{:<ws$}", c.status)),
            paint(use_color, YELLOW, &format!("{:<wi$}", c.image)),
            c.mode.as_str(),
            paint(use_color, GRAY, &created(c)),
        );
    }
}

fn build_service() -> kapsule::Result<ContainerService> {
    let settings = ServiceSettings::from_env()?;
    let hypervisor = Arc::new(IncusClient::new(
        settings.incus_socket.clone(),
        settings.incus_timeout,
    ));
    let runner = Arc::new(ProcessRunner::new(settings.command_timeout));
    Ok(ContainerService::new(Backend::new(hypervisor, runner, settings)))
}

fn needs_incus(cmd: &Command) -> bool {
    !matches!(cmd, Command::Schema | Command::Doctor | Command::Config { .. })
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let service = build_service()?;
    let verbose = cli.verbose;

    if needs_incus(&cli.command) && !service.is_available().await {
        error_line("Incus is not available.");
        hint_line("Run: sudo kapsule init");
        return Ok(ExitCode::from(1));
    }

    match cli.command {
        Command::Create {
            name,
            image,
            session,
            dbus_mux,
            options,
        } => {
            let mut raw = Map::new();
            if session {
                raw.insert("session_mode".to_string(), Value::Bool(true));
            }
            if dbus_mux {
                raw.insert("dbus_mux".to_string(), Value::Bool(true));
            }
            for assignment in &options {
                apply_assignment(&mut raw, assignment).map_err(KapsuleError::from)?;
            }
            let image = match image.filter(|i| !i.trim().is_empty()) {
                Some(i) => i,
                None => service.get_config(current_uid())?.default_image,
            };
            Ok(with_progress(&service, verbose, service.create_container(&name, &image, &raw)).await?)
        }
        Command::Rm { name, force } => {
            Ok(with_progress(&service, verbose, service.delete_container(&name, force)).await?)
        }
        Command::Start { name } => {
            Ok(with_progress(&service, verbose, service.start_container(&name)).await?)
        }
        Command::Stop { name, force } => {
            Ok(with_progress(&service, verbose, service.stop_container(&name, force)).await?)
        }
        Command::SetupUser { container } => {
            let user = HostUser::from_uid(current_uid())?;
            Ok(with_progress(&service, verbose, service.setup_user(&container, &user)).await?)
        }
        Command::Enter {
            print,
            name,
            command,
        } => {
            let user = HostUser::from_uid(current_uid())?;
            let argv = service
                .prepare_enter(&user, name.as_deref(), &command, &caller_env())
                .await?;
            if print {
                println!("{}", shell_join(&argv));
                return Ok(ExitCode::SUCCESS);
            }
            let (program, args) = argv
                .split_first()
                .ok_or_else(|| KapsuleError::Internal("empty enter command".to_string()))?;
            let err = std::process::Command::new(program).args(args).exec();
            Err::<ExitCode, _>(KapsuleError::Io(err)).with_context(|| format!("cannot run {program}"))
        }
        Command::List { all } => {
            let list = service.list_containers().await?;
            let use_err = color_enabled_stderr();
            if list.is_empty() {
                eprintln!("{}", paint(use_err, GRAY, "No containers found."));
                return Ok(ExitCode::SUCCESS);
            }
            let shown: Vec<ContainerSummary> = list
                .into_iter()
                .filter(|c| all || c.status.eq_ignore_ascii_case("running"))
                .collect();
            if shown.is_empty() {
                eprintln!(
                    "{}",
                    paint(use_err, GRAY, "No running containers. Use --all to see stopped containers.")
                );
                return Ok(ExitCode::SUCCESS);
            }
            print_containers(&shown);
            Ok(ExitCode::SUCCESS)
        }
        Command::Info { name } => {
            let info = service.get_container_info(&name).await?;
            println!("name:    {}", info.name);
            println!("status:  {}", info.status);
            println!("image:   {}", info.image);
            println!("mode:    {}", info.mode);
            println!("created: {}", info.created);
            println!(
                "user set up: {}",
                if service.is_user_setup(&name, current_uid()).await { "yes" } else { "no" }
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Config { key } => {
            let config = service.get_config(current_uid())?;
            match key {
                None => {
                    for (k, v) in config.entries() {
                        println!("{k:<18} {v}");
                    }
                    Ok(ExitCode::SUCCESS)
                }
                Some(key) => match config.get(&key) {
                    Some(v) => {
                        println!("{key} = {v}");
                        Ok(ExitCode::SUCCESS)
                    }
                    None => {
                        error_line(&format!("Unknown config key: {key}"));
                        hint_line("Valid keys: default_container, default_image");
                        Ok(ExitCode::from(1))
                    }
                },
            }
        }
        Command::Schema => {
            println!("{}", service.create_schema_json()?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Init => {
            let result = service.ensure_profile().await?;
            eprintln!(
                "{}",
                paint(
                    color_enabled_stderr(),
                    GREEN,
                    &format!("✓ Profile '{}' {}", kapsule::hypervisor::BASE_PROFILE_NAME, result.as_str())
                )
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Doctor => {
            run_doctor(&service, verbose).await;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Some(mode) = cli.color {
        set_color_mode(mode);
    }
    kapsule::telemetry::init(cli.verbose);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error_line(&format!("kapsule: cannot start runtime: {e}"));
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            error_line(&format!("kapsule: {e:#}"));
            ExitCode::from(exit_code(&e))
        }
    }
}
