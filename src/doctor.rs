//! `kapsule doctor`: print what the tool sees of its environment.

use std::path::Path;

use which::which;

use crate::color::{color_enabled_stderr, paint, BLUE, RED, YELLOW};
use crate::config::UserConfig;
use crate::container::constants::PROFILE_HASH_KEY;
use crate::container::ContainerService;
use crate::hypervisor::{build_profile, BASE_PROFILE_NAME};
use crate::util::ExecRequest;

fn yes_no(use_color: bool, ok: bool) -> String {
    if ok {
        paint(use_color, BLUE, "yes")
    } else {
        paint(use_color, RED, "no")
    }
}

fn binary_line(use_color: bool, label: &str, bin: &str) {
    match which(bin) {
        Ok(p) => eprintln!("  {label:<16} {}", p.display()),
        Err(_) => eprintln!("  {label:<16} {}", paint(use_color, RED, &format!("{bin} (not found)"))),
    }
}

async fn profile_status(service: &ContainerService) -> String {
    let hv = &service.backend().hypervisor;
    match hv.profile_exists(BASE_PROFILE_NAME).await {
        Ok(false) => return "missing (run `kapsule init`)".to_string(),
        Ok(true) => {}
        Err(e) => return format!("unknown ({e})"),
    }
    let (existing, desired) = match (hv.get_profile(BASE_PROFILE_NAME).await, build_profile()) {
        (Ok(existing), Ok(desired)) => (existing, desired),
        (Err(e), _) => return format!("unknown ({e})"),
        (_, Err(e)) => return format!("unknown ({e})"),
    };
    if existing.config.get(PROFILE_HASH_KEY) == desired.config.get(PROFILE_HASH_KEY) {
        "up to date".to_string()
    } else {
        "outdated (run `kapsule init`)".to_string()
    }
}

pub async fn run_doctor(service: &ContainerService, verbose: bool) {
    let use_color = color_enabled_stderr();
    let settings = &service.backend().settings;

    eprintln!("kapsule doctor");
    eprintln!();
    eprintln!("  version: v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "  host:    {} / {}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    if verbose {
        eprintln!("  build:   {} ({})", env!("KAPSULE_BUILD_DATE"), env!("KAPSULE_BUILD_TARGET"));
        eprintln!("  rustc:   {}", env!("KAPSULE_BUILD_RUSTC"));
    }
    eprintln!();

    binary_line(use_color, "incus command:", &settings.incus_bin);
    if which(&settings.incus_bin).is_ok() {
        let request = ExecRequest::new(settings.incus_bin.as_str()).arg("--version");
        if let Ok(out) = service.backend().runner.run(request).await {
            let v = out.stdout.trim();
            if out.success() && !v.is_empty() {
                eprintln!("  incus version:   {v}");
            }
        }
    }
    binary_line(use_color, "nsenter command:", &settings.nsenter_bin);
    eprintln!();

    let socket = &settings.incus_socket;
    eprintln!(
        "  incus socket:    {} (present: {})",
        socket.display(),
        yes_no(use_color, socket.exists())
    );
    let available = service.is_available().await;
    eprintln!("  incus reachable: {}", yes_no(use_color, available));
    if available {
        eprintln!("  base profile:    {}", profile_status(service).await);
        match service.list_containers().await {
            Ok(list) => eprintln!("  containers:      {}", list.len()),
            Err(e) => eprintln!("  containers:      {}", paint(use_color, YELLOW, &e.to_string())),
        }
    } else if verbose {
        eprintln!("    tip: start the Incus socket (`kapsule init` as root) and check group membership.");
    }
    eprintln!();

    let hook = &settings.nvidia_hook;
    eprintln!(
        "  nvidia hook:     {} (present: {})",
        hook.display(),
        yes_no(use_color, hook.is_file())
    );
    eprintln!(
        "  runtime root:    {}",
        settings.host_runtime_root.display()
    );
    eprintln!();

    let home = home::home_dir();
    for path in UserConfig::layer_paths(home.as_deref()) {
        let present = Path::new(&path).is_file();
        eprintln!("  config layer:    {} (present: {})", path.display(), yes_no(use_color, present));
    }
    match UserConfig::load(home.as_deref()) {
        Ok(cfg) => {
            for (k, v) in cfg.entries() {
                eprintln!("  {:<16} {v}", format!("{k}:"));
            }
        }
        Err(e) => eprintln!("  config:          {}", paint(use_color, RED, &e.to_string())),
    }

    eprintln!();
    eprintln!("doctor: completed diagnostics.");
}
