use std::env;
use std::fs::File;
use std::io::Write;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info, LevelFilter};
use nix::unistd::{Gid, Group, Uid, User};

use seatmand::server::Server;

const DEFAULT_SOCK_PATH: &str = "/run/seatd.sock";

#[derive(Parser)]
#[command(
    name = "seatmand",
    version,
    disable_version_flag = true,
    about = "Seat management daemon"
)]
struct Cli {
    /// Write a byte to this fd and close it once the socket is ready
    #[arg(short = 'n', value_name = "FD")]
    notify_fd: Option<RawFd>,

    /// Path of the listening socket
    #[arg(short = 's', value_name = "PATH")]
    socket: Option<PathBuf>,

    /// User that should own the socket
    #[arg(short = 'u', value_name = "USER")]
    user: Option<String>,

    /// Group that should own the socket
    #[arg(short = 'g', value_name = "GROUP")]
    group: Option<String>,

    /// Show the version number
    #[arg(short = 'v', action = clap::ArgAction::Version)]
    version: Option<bool>,
}

fn init_logger() {
    let level = match env::var("SEATD_LOGLEVEL").as_deref() {
        Ok("silent") => LevelFilter::Off,
        Ok("info") => LevelFilter::Info,
        Ok("debug") => LevelFilter::Debug,
        _ => LevelFilter::Error,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp_millis()
        .init();
}

fn resolve_owner(cli: &Cli) -> Result<(Option<Uid>, Option<Gid>), String> {
    let mut uid = None;
    let mut gid = None;
    if let Some(name) = &cli.user {
        let user = User::from_name(name)
            .map_err(|err| format!("could not look up user '{name}': {err}"))?
            .ok_or_else(|| format!("no such user: {name}"))?;
        uid = Some(user.uid);
        gid = Some(user.gid);
    }
    if let Some(name) = &cli.group {
        let group = Group::from_name(name)
            .map_err(|err| format!("could not look up group '{name}': {err}"))?
            .ok_or_else(|| format!("no such group: {name}"))?;
        gid = Some(group.gid);
    }
    Ok((uid, gid))
}

fn notify_readiness(fd: RawFd) {
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    let mut file = File::from(fd);
    if let Err(err) = file.write_all(&[0]) {
        error!("could not send readiness notification: {err}");
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logger();

    let vt_bound = env::var("SEATD_VTBOUND").map_or(true, |value| value != "0");
    let socket_path = cli
        .socket
        .clone()
        .or_else(|| env::var_os("SEATD_SOCK").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCK_PATH));

    let (owner_uid, owner_gid) = match resolve_owner(&cli) {
        Ok(owner) => owner,
        Err(err) => {
            error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let mut server = match Server::new(socket_path.clone(), owner_uid, owner_gid, vt_bound) {
        Ok(server) => server,
        Err(err) => {
            error!("could not start server: {err}");
            return ExitCode::FAILURE;
        }
    };

    info!("seatmand started on {}", socket_path.display());
    if let Some(fd) = cli.notify_fd {
        notify_readiness(fd);
    }

    match server.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("poller failed: {err}");
            ExitCode::FAILURE
        }
    }
}
