use std::{
    convert::Infallible,
    future::Future,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Result};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tempdir::TempDir;
use tokio::{
    join,
    process::{Child, Command},
    sync::oneshot,
    time::timeout,
};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, StopBits};
use tracing::{debug, warn};

use crate::grbl_sim::{GrblSimulator, Journal, SimulatorSettings};

const CREATION_WAIT: Duration = Duration::from_secs(5);

fn watch_for_creation(path: PathBuf) -> Result<impl Future<Output = Result<()>>> {
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow!("Invalid path: {:?}", path))?
        .to_owned();
    let directory = path
        .parent()
        .ok_or_else(|| anyhow!("Invalid path: {:?}", path))?
        .to_owned();
    let (sender, receiver) = oneshot::channel();
    let mut sender = Some(sender);
    let mut watcher = RecommendedWatcher::new(
        move |event: notify::Result<notify::Event>| {
            let Ok(event) = event else { return };
            if matches!(event.kind, EventKind::Create(_))
                && event.paths.iter().any(|p| p.ends_with(&file_name))
            {
                if let Some(sender) = sender.take() {
                    drop(sender.send(()));
                }
            }
        },
        notify::Config::default(),
    )?;
    watcher.watch(&directory, RecursiveMode::NonRecursive)?;
    Ok(async move {
        // The watcher is live by now, so a file created earlier is caught here.
        let result = if path.exists() {
            Ok(())
        } else {
            match timeout(CREATION_WAIT, receiver).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(anyhow!("Watcher dropped while waiting for {:?}", path)),
                Err(_) => Err(anyhow!("{:?} was not created in time", path)),
            }
        };
        drop(watcher);
        result
    })
}

async fn wait_for_creation(path: PathBuf) -> Result<()> {
    let mut attempts = 3;
    loop {
        match watch_for_creation(path.clone()) {
            Ok(wait) => return wait.await,
            Err(e) if attempts > 0 => {
                warn!("retrying watch on {:?}: {}", path, e);
                attempts -= 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn interrupt(mut child: Child) {
    if let Some(pid) = child.id() {
        // SIGINT lets socat remove its pty links; SIGKILL would leave them behind.
        if let Ok(mut kill) = Command::new("kill").arg("-2").arg(pid.to_string()).spawn() {
            drop(kill.wait().await);
        }
    }
    drop(child.wait().await);
}

async fn spawn_pty_pair(host: &Path, machine: &Path) -> Result<Child> {
    let child = Command::new("socat")
        .arg(format!("pty,raw,echo=0,link={}", host.to_string_lossy()))
        .arg(format!("pty,raw,echo=0,link={}", machine.to_string_lossy()))
        .kill_on_drop(true)
        .spawn()?;
    let (host_ready, machine_ready) = join!(
        wait_for_creation(host.to_owned()),
        wait_for_creation(machine.to_owned()),
    );
    if let Err(e) = host_ready.and(machine_ready) {
        interrupt(child).await;
        return Err(e);
    }
    Ok(child)
}

/// A pseudo-terminal whose far end is driven by a [`GrblSimulator`].
/// The simulator and socat are torn down when this is dropped.
pub struct SimulatedPort {
    path: PathBuf,
    journal: Journal,
    _halt: oneshot::Sender<Infallible>,
}

impl SimulatedPort {
    /// Device path to hand to the capture tool.
    pub fn path(&self) -> &Path {
        &self.path
    }
    pub fn journal(&self) -> &Journal {
        &self.journal
    }
}

// Should only be called from within a tokio runtime.
pub async fn simulated_port(settings: SimulatorSettings) -> Result<SimulatedPort> {
    let directory = TempDir::new("grbl-sim")?;
    let host_path = directory.path().join("host_port");
    let machine_path = directory.path().join("machine_port");
    let socat = spawn_pty_pair(&host_path, &machine_path).await?;
    let port = tokio_serial::new(machine_path.to_string_lossy(), 115200)
        .data_bits(DataBits::Eight)
        .flow_control(FlowControl::None)
        .timeout(Duration::from_millis(30))
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .open_native_async()?;
    let (input, output) = tokio::io::split(port);
    let simulator = GrblSimulator::new(settings);
    let journal = simulator.journal();
    let machine_task = tokio::spawn(simulator.run(input, output));
    let (halt, halted) = oneshot::channel::<Infallible>();
    tokio::spawn(async move {
        drop(halted.await);
        machine_task.abort();
        drop(machine_task.await);
        interrupt(socat).await;
        drop(directory);
        debug!("simulated port torn down");
    });
    Ok(SimulatedPort { path: host_path, journal, _halt: halt })
}
