use std::{sync::Arc, time::Duration};

use common::grbl::MachineStatus;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use super::{
    messages::{GrblMessage, GrblState, GrblStatus},
    parser::parse_grbl_line,
};
use crate::{
    cnc::connection::{LinkObserver, SerialLink},
    error::{RigError, RigResult},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Disconnected,
    Connected,
    Unlocked,
    Homed,
    Idle,
    Moving,
}

#[derive(Debug, Clone)]
pub struct ControllerTimeouts {
    /// Longest wait for `ok`/`error` after an ordinary command.
    pub ack: Duration,
    /// `$H` is only acknowledged once the homing cycle ends.
    pub home: Duration,
    pub poll_interval: Duration,
}

impl Default for ControllerTimeouts {
    fn default() -> Self {
        ControllerTimeouts {
            ack: Duration::from_secs(10),
            home: Duration::from_secs(120),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Formats a coordinate or feed the way a person would type it: `10`, `-2.5`, `0.125`.
pub fn format_number(value: f64) -> String {
    let value = if value == 0.0 { 0.0 } else { value };
    let text = format!("{:.4}", value);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text == "-0" {
        "0".to_string()
    } else {
        text.to_string()
    }
}

/// Speaks the GRBL line protocol over a [`SerialLink`].
pub struct MotionController {
    link: SerialLink,
    state: ControllerState,
    timeouts: ControllerTimeouts,
    last_status: Option<GrblStatus>,
    last_raw_status: String,
    last_motion: String,
}

impl MotionController {
    pub fn new(link: SerialLink, timeouts: ControllerTimeouts) -> Self {
        MotionController {
            link,
            state: ControllerState::Disconnected,
            timeouts,
            last_status: None,
            last_raw_status: String::from("<none>"),
            last_motion: String::new(),
        }
    }
    /// Opens the port and performs the reset handshake.
    pub async fn connect(
        port: &str,
        baud_rate: u32,
        settle: Duration,
        timeouts: ControllerTimeouts,
    ) -> RigResult<Self> {
        let link = SerialLink::open(port, baud_rate)?;
        let mut controller = MotionController::new(link, timeouts);
        controller.handshake(settle).await?;
        Ok(controller)
    }
    /// Wakes the controller, waits `settle`, and throws away whatever it said meanwhile.
    pub async fn handshake(&mut self, settle: Duration) -> RigResult<()> {
        self.link.settle(settle).await?;
        self.state = ControllerState::Connected;
        debug!("controller connected");
        Ok(())
    }
    pub fn state(&self) -> ControllerState {
        self.state
    }
    pub fn last_status(&self) -> Option<&GrblStatus> {
        self.last_status.as_ref()
    }
    pub fn set_observer(&mut self, observer: Arc<dyn LinkObserver>) {
        self.link.set_observer(observer);
    }

    fn record_status(&mut self, status: GrblStatus, raw: &str) {
        self.link.observer().after_status(MachineStatus::from(&status.state), raw);
        self.last_status = Some(status);
        self.last_raw_status = raw.to_string();
    }

    async fn wait_ack(&mut self, command: &str, wait: Duration) -> RigResult<Vec<String>> {
        let deadline = Instant::now() + wait;
        let mut replies = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(line) = self.link.read_line(remaining).await? else {
                return Err(RigError::Controller {
                    command: command.to_string(),
                    response: replies.join(" | "),
                    code: None,
                    description: format!("no acknowledgment within {:?}", wait),
                });
            };
            let message = parse_grbl_line(&line);
            match message {
                // Unsolicited reports may interleave with any reply; never an ack.
                GrblMessage::StatusEvent(status) => {
                    self.record_status(status, &line);
                    continue;
                }
                GrblMessage::GrblAlarm(code) => {
                    return Err(RigError::Controller {
                        command: command.to_string(),
                        response: line,
                        code: Some(code),
                        description: GrblMessage::get_alarm_text(code).into_owned(),
                    });
                }
                _ => (),
            }
            if line.contains("error") {
                let code = match message {
                    GrblMessage::GrblError(code) => Some(code),
                    _ => None,
                };
                let description = code
                    .map(|code| GrblMessage::get_error_text(code).into_owned())
                    .unwrap_or_else(|| "controller reported an error".to_string());
                return Err(RigError::Controller {
                    command: command.to_string(),
                    response: line,
                    code,
                    description,
                });
            }
            if line.contains("ok") {
                return Ok(replies);
            }
            replies.push(line);
        }
    }

    async fn send_and_wait_ack_within(&mut self, command: &str, wait: Duration) -> RigResult<Vec<String>> {
        self.link.write_command(command).await?;
        self.wait_ack(command, wait).await
    }

    /// Sends one line and reads until a reply containing `ok` or `error`.
    /// Returns the other lines that arrived before the acknowledgment.
    pub async fn send_and_wait_ack(&mut self, command: &str) -> RigResult<Vec<String>> {
        let wait = self.timeouts.ack;
        self.send_and_wait_ack_within(command, wait).await
    }

    pub async fn unlock(&mut self) -> RigResult<()> {
        self.send_and_wait_ack("$X").await?;
        self.state = ControllerState::Unlocked;
        Ok(())
    }
    pub async fn home(&mut self) -> RigResult<()> {
        let wait = self.timeouts.home;
        self.last_motion = "$H".into();
        self.send_and_wait_ack_within("$H", wait).await?;
        self.state = ControllerState::Homed;
        Ok(())
    }
    pub async fn set_feed_rate(&mut self, rate: f64) -> RigResult<()> {
        self.send_and_wait_ack(&format!("G1 F{}", format_number(rate))).await?;
        Ok(())
    }
    /// Queues an absolute move. The machine is still travelling when this returns.
    pub async fn move_to(&mut self, x: f64, y: f64) -> RigResult<()> {
        let command = format!("G1 X{} Y{}", format_number(x), format_number(y));
        self.send_and_wait_ack(&command).await?;
        self.last_motion = command;
        self.state = ControllerState::Moving;
        Ok(())
    }
    pub async fn return_to_origin(&mut self) -> RigResult<()> {
        let command = "G0 X0 Y0";
        self.send_and_wait_ack(command).await?;
        self.last_motion = command.into();
        self.state = ControllerState::Moving;
        Ok(())
    }
    /// The `$` dump, one `$N=V` line per entry.
    pub async fn settings(&mut self) -> RigResult<Vec<String>> {
        self.send_and_wait_ack("$").await
    }

    /// Sends the realtime `?` and waits one poll interval for the report.
    pub async fn query_status(&mut self) -> RigResult<Option<GrblStatus>> {
        self.link.write(b"?").await?;
        let deadline = Instant::now() + self.timeouts.poll_interval;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(line) = self.link.read_line(remaining).await? else {
                return Ok(None);
            };
            match parse_grbl_line(&line) {
                GrblMessage::StatusEvent(status) => {
                    self.record_status(status.clone(), &line);
                    return Ok(Some(status));
                }
                other => debug!("ignoring {:?} while polling status", other),
            }
        }
    }

    /// Polls until the machine reports `Idle`. Fails fast on `Alarm`; otherwise
    /// fails with [`RigError::MotionTimeout`] no earlier than `limit`.
    pub async fn await_idle(&mut self, limit: Duration) -> RigResult<GrblStatus> {
        let started = Instant::now();
        let deadline = started + limit;
        loop {
            let next_poll = Instant::now() + self.timeouts.poll_interval;
            if let Some(status) = self.query_status().await? {
                match status.state {
                    GrblState::Idle => {
                        self.state = ControllerState::Idle;
                        return Ok(status);
                    }
                    GrblState::Alarm => {
                        return Err(RigError::Controller {
                            command: self.last_motion.clone(),
                            response: self.last_raw_status.clone(),
                            code: None,
                            description: "machine entered alarm state".into(),
                        });
                    }
                    _ => (),
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RigError::MotionTimeout {
                    command: self.last_motion.clone(),
                    waited: now - started,
                    last_status: self.last_raw_status.clone(),
                });
            }
            sleep_until(next_poll.min(deadline)).await;
        }
    }

    pub async fn close(&mut self) {
        self.link.close().await;
        self.state = ControllerState::Disconnected;
        info!("serial link closed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use machine_mock::{GrblSimulator, Journal, SimulatorSettings};
    use tokio::io::split;

    use super::*;

    fn fast_timeouts() -> ControllerTimeouts {
        ControllerTimeouts {
            ack: Duration::from_millis(500),
            home: Duration::from_millis(500),
            poll_interval: Duration::from_millis(20),
        }
    }

    async fn simulated(settings: SimulatorSettings) -> (MotionController, Journal) {
        let (host, journal, _task) = GrblSimulator::new(settings).spawn();
        let (reader, writer) = split(host);
        let mut controller = MotionController::new(SerialLink::new(reader, writer), fast_timeouts());
        controller.handshake(Duration::from_millis(10)).await.unwrap();
        (controller, journal)
    }

    #[test]
    fn numbers_are_compact() {
        assert_eq!(format_number(10.0), "10");
        assert_eq!(format_number(-2.5), "-2.5");
        assert_eq!(format_number(0.125), "0.125");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(14000.0), "14000");
    }

    #[tokio::test]
    async fn immediate_idle_takes_exactly_one_poll() {
        let (mut controller, journal) = simulated(SimulatorSettings::default()).await;
        let status = controller.await_idle(Duration::from_secs(1)).await.unwrap();
        assert_eq!(status.state, GrblState::Idle);
        assert_eq!(journal.count("?"), 1);
        assert_eq!(controller.state(), ControllerState::Idle);
    }

    #[tokio::test]
    async fn never_idle_times_out_after_the_limit() {
        let (mut controller, _journal) = simulated(SimulatorSettings {
            never_idle: true,
            ..Default::default()
        })
        .await;
        let limit = Duration::from_millis(150);
        let started = Instant::now();
        let result = controller.await_idle(limit).await;
        assert!(started.elapsed() >= limit);
        match result {
            Err(RigError::MotionTimeout { waited, last_status, .. }) => {
                assert!(waited >= limit);
                assert!(last_status.starts_with("<Run"));
            }
            other => panic!("expected a motion timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn move_waits_for_ack_and_then_idle() {
        let (mut controller, journal) = simulated(SimulatorSettings {
            chatty: true,
            ..Default::default()
        })
        .await;
        controller.unlock().await.unwrap();
        controller.set_feed_rate(14000.0).await.unwrap();
        controller.move_to(10.0, -2.5).await.unwrap();
        assert_eq!(controller.state(), ControllerState::Moving);
        let status = controller.await_idle(Duration::from_secs(2)).await.unwrap();
        assert_eq!(status.xy(), Some((10.0, -2.5)));
        assert_eq!(controller.last_status().and_then(|s| s.xy()), Some((10.0, -2.5)));
        assert_eq!(
            journal.commands().into_iter().filter(|c| c != "?").collect::<Vec<_>>(),
            vec!["$X", "G1 F14000", "G1 X10 Y-2.5"]
        );
    }

    #[tokio::test]
    async fn error_reply_is_a_controller_error() {
        let mut settings = SimulatorSettings::default();
        settings.rejected.insert("G1 X5 Y5".into(), 33);
        let (mut controller, _journal) = simulated(settings).await;
        match controller.move_to(5.0, 5.0).await {
            Err(RigError::Controller { code, response, .. }) => {
                assert_eq!(code, Some(33));
                assert_eq!(response, "error:33");
            }
            other => panic!("expected a controller error, got {:?}", other),
        }
        // The link is still usable afterwards.
        controller.move_to(1.0, 1.0).await.unwrap();
    }

    #[tokio::test]
    async fn alarm_while_homing_fails_fast() {
        let mut settings = SimulatorSettings::default();
        settings.alarms.insert("$H".into(), 9);
        let (mut controller, _journal) = simulated(settings).await;
        match controller.home().await {
            Err(RigError::Controller { code, .. }) => assert_eq!(code, Some(9)),
            other => panic!("expected an alarm, got {:?}", other),
        }
        let started = Instant::now();
        assert!(matches!(
            controller.await_idle(Duration::from_secs(5)).await,
            Err(RigError::Controller { .. })
        ));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn settings_dump_is_collected() {
        let (mut controller, _journal) = simulated(SimulatorSettings::default()).await;
        let dump = controller.settings().await.unwrap();
        assert!(dump.contains(&"$110=14000.000".to_string()));
        assert!(dump.iter().all(|line| line.starts_with('$')));
    }
}
