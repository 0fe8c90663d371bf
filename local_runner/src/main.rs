use std::time::Duration;

use anyhow::Context;
use machine_mock::{socat_port::simulated_port, SimulatorSettings};
use serde_json::json;
use tokio::{fs::{create_dir_all, write}, process::Command, select, sync::oneshot};

/// Drives the capture tool against a simulated controller on a pseudo-terminal.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (sender, receiver) = oneshot::channel();
    let mut sender = Some(sender);
    ctrlc::set_handler(move || {
        if let Some(sender) = sender.take() {
            drop(sender.send(()));
            println!("Shutting down!");
        } else {
            std::process::exit(130);
        }
    })?;
    create_dir_all("../test_data/images").await?;
    let config = json!({
        "feed_rate": 14000,
        "settle_delay_secs": 0.5,
        "move_timeout_secs": 10,
        "plants": [
            {"id": "B01", "X": -10, "Y": 20},
            {"id": "B02", "X": -60, "Y": 20},
            {"id": "B03", "X": -110, "Y": 20},
            {"id": "B04", "X": -110, "Y": 70},
            {"id": "B05", "X": -60, "Y": 70},
            {"id": "B06", "X": -10, "Y": 70}
        ],
        "camera_tuning": {"capture_width": 640, "capture_height": 360}
    });
    write("../test_data/rig.json", serde_json::to_vec_pretty(&config)?).await?;

    let port = simulated_port(SimulatorSettings {
        move_duration: Duration::from_millis(400),
        ..Default::default()
    })
    .await
    .context("Starting the simulated controller (is socat installed?)")?;
    let mut child = Command::new("cargo")
        .arg("run")
        .arg("--manifest-path")
        .arg("../capture/Cargo.toml")
        .arg("--")
        .arg("--config")
        .arg("../test_data/rig.json")
        .arg("--port")
        .arg(port.path().as_os_str())
        .arg("--output")
        .arg("../test_data/images")
        .arg("--log-file")
        .arg("../test_data/run.log")
        .arg("--synthetic-camera")
        .spawn()?;
    select! {
        result = child.wait() => {
            println!("Capture finished with result: {:?}", result);
        }
        _ = receiver => {
            if let Some(pid) = child.id() {
                println!("Asking the capture run to stop...");
                // The capture tool treats SIGINT as a request to stop before the next target.
                Command::new("kill").arg("-2").arg(pid.to_string()).spawn()?.wait().await?;
                child.wait().await?;
            }
        }
    }
    println!("Commands seen by the simulator:");
    for command in port.journal().commands().iter().filter(|c| *c != "?") {
        println!("  {}", command);
    }
    Ok(())
}
