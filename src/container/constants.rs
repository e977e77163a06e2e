//! Paths and metadata keys shared by the provisioning pipelines.

/// Reserved namespace for Kapsule metadata in instance config.
pub const KEY_PREFIX: &str = "user.kapsule.";

pub const SESSION_MODE_KEY: &str = "user.kapsule.session-mode";
pub const DBUS_MUX_KEY: &str = "user.kapsule.dbus-mux";
pub const HOST_ROOTFS_KEY: &str = "user.kapsule.host-rootfs";
pub const MOUNT_HOME_KEY: &str = "user.kapsule.mount-home";
pub const CUSTOM_MOUNTS_KEY: &str = "user.kapsule.custom-mounts";
pub const GPU_KEY: &str = "user.kapsule.gpu";
pub const NVIDIA_DRIVERS_KEY: &str = "user.kapsule.nvidia-drivers";
pub const PROFILE_HASH_KEY: &str = "user.kapsule.profile-hash";

/// `user.kapsule.host-users.<uid>.mapped`
pub fn user_mapped_key(uid: u32) -> String {
    format!("user.kapsule.host-users.{uid}.mapped")
}

/// Where the host root filesystem appears inside a container.
pub const HOST_MOUNT_ROOT: &str = "/.kapsule/host";

/// Share the host network namespace.
pub const RAW_LXC_HOST_NETWORK: &str = "lxc.net.0.type=none\n";

pub const DBUS_MUX_BIN: &str = "/.kapsule/host/usr/lib/kapsule/kapsule-dbus-mux";
pub const DBUS_MUX_UNIT: &str = "kapsule-dbus-mux.service";

/// Container D-Bus socket as seen by systemd (`%t` is the user runtime dir).
pub fn dbus_socket_systemd(container: &str) -> String {
    format!("{HOST_MOUNT_ROOT}%t/kapsule/{container}/dbus.socket")
}

/// Placeholder uid used to prepare host-side directories at creation time.
pub const SESSION_PLACEHOLDER_UID: u32 = 1000;

pub const X11_SOCKET_DIR: &str = "/tmp/.X11-unix";

/// Environment variables never forwarded into an entered session.
pub const ENTER_ENV_SKIP: &[&str] = &["_", "SHLVL", "OLDPWD", "PWD", "HOSTNAME", "HOST", "LS_COLORS"];

/// Prefix of less(1) colour variables, also never forwarded.
pub const ENTER_ENV_SKIP_PREFIX: &str = "LESS_TERMCAP_";

pub const DEFAULT_IMAGE_SERVER: &str = "images";

/// Known image servers by short name.
pub const IMAGE_SERVERS: &[(&str, &str)] = &[
    ("images", "https://images.linuxcontainers.org"),
    ("ubuntu", "https://cloud-images.ubuntu.com/releases"),
];

pub fn image_server_url(server: &str) -> Option<&'static str> {
    IMAGE_SERVERS
        .iter()
        .find(|(name, _)| *name == server)
        .map(|(_, url)| *url)
}
