use std::{
    collections::HashMap,
    pin::pin,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    io::{duplex, split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream},
    task::JoinHandle,
    time::{sleep, Instant},
};
use tracing::debug;

const GREETING: &[u8] = b"\r\nGrbl 1.1h ['$' for help]\r\n";
const SETTINGS_DUMP: &str = "$0=10\r\n$1=25\r\n$22=1\r\n$100=80.000\r\n$101=80.000\r\n$110=14000.000\r\n$111=14000.000\r\n$130=1200.000\r\n$131=700.000\r\nok\r\n";

#[derive(Debug, Clone)]
pub struct SimulatorSettings {
    /// How long a move or a homing cycle keeps the machine busy.
    pub move_duration: Duration,
    /// Report `Run` on every status query.
    pub never_idle: bool,
    /// Exact commands answered with `error:<code>`.
    pub rejected: HashMap<String, u64>,
    /// Exact commands answered with `ALARM:<code>`; the machine then stays in alarm until `$X`.
    pub alarms: HashMap<String, u64>,
    pub greeting: bool,
    /// Send an unsolicited status report ahead of every `ok`.
    pub chatty: bool,
    /// Drop the connection instead of answering the n-th line command (0-based).
    pub hang_up_at: Option<usize>,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        SimulatorSettings {
            move_duration: Duration::from_millis(30),
            never_idle: false,
            rejected: HashMap::new(),
            alarms: HashMap::new(),
            greeting: true,
            chatty: false,
            hang_up_at: None,
        }
    }
}

/// Every command the simulator received, in order. Status queries appear as `?`.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    fn record(&self, command: &str) {
        if let Ok(mut commands) = self.0.lock() {
            commands.push(command.to_string());
        }
    }
    pub fn commands(&self) -> Vec<String> {
        self.0.lock().map(|commands| commands.clone()).unwrap_or_default()
    }
    /// Only the commands that carry an X or Y word.
    pub fn moves(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|command| command.starts_with('G') && command.split_whitespace().any(|word| word.starts_with('X') || word.starts_with('Y')))
            .collect()
    }
    pub fn count(&self, command: &str) -> usize {
        self.commands().iter().filter(|c| *c == command).count()
    }
}

/// A GRBL 1.1 controller that is good enough to drive a capture run.
pub struct GrblSimulator {
    settings: SimulatorSettings,
    journal: Journal,
    position: (f64, f64),
    feed: f64,
    busy: Option<(&'static str, Instant)>,
    alarm: bool,
    lines_seen: usize,
}

impl GrblSimulator {
    pub fn new(settings: SimulatorSettings) -> Self {
        GrblSimulator {
            settings,
            journal: Journal::default(),
            position: (0.0, 0.0),
            feed: 0.0,
            busy: None,
            alarm: false,
            lines_seen: 0,
        }
    }
    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }
    /// Runs the simulator on one end of an in-memory pipe and hands back the other end.
    pub fn spawn(self) -> (DuplexStream, Journal, JoinHandle<()>) {
        let (host, machine) = duplex(4096);
        let journal = self.journal();
        let (input, output) = split(machine);
        let task = tokio::spawn(self.run(input, output));
        (host, journal, task)
    }
    fn state_name(&self) -> &'static str {
        if self.alarm {
            "Alarm"
        } else if self.settings.never_idle {
            "Run"
        } else {
            match self.busy {
                Some((state, until)) if Instant::now() < until => state,
                _ => "Idle",
            }
        }
    }
    fn status_report(&self) -> String {
        format!(
            "<{}|MPos:{:.3},{:.3},0.000|FS:{},0>\r\n",
            self.state_name(),
            self.position.0,
            self.position.1,
            self.feed
        )
    }
    async fn execute(&mut self, command: &str) -> String {
        if let Some(code) = self.settings.alarms.get(command) {
            self.alarm = true;
            return format!("ALARM:{}\r\n[MSG:Reset to continue]\r\n", code);
        }
        if let Some(code) = self.settings.rejected.get(command) {
            return format!("error:{}\r\n", code);
        }
        if self.alarm && command != "$X" && command != "$" {
            return "error:9\r\n".into();
        }
        let ok = if self.settings.chatty {
            format!("{}ok\r\n", self.status_report())
        } else {
            "ok\r\n".to_string()
        };
        match command {
            "$X" => {
                self.alarm = false;
                format!("[MSG:Caution: Unlocked]\r\n{}", ok)
            }
            "$H" => {
                // GRBL only acknowledges homing once the cycle is over.
                self.busy = Some(("Home", Instant::now() + self.settings.move_duration));
                sleep(self.settings.move_duration).await;
                self.position = (0.0, 0.0);
                ok
            }
            "$" => SETTINGS_DUMP.to_string(),
            c if c.starts_with('$') => ok,
            c if c.starts_with("G0") || c.starts_with("G1") => {
                let mut target = self.position;
                let mut moves = false;
                for word in c.split_whitespace().skip(1) {
                    let Some(letter) = word.chars().next() else { continue };
                    let Ok(value) = word[letter.len_utf8()..].parse::<f64>() else {
                        return "error:2\r\n".into();
                    };
                    match letter {
                        'X' => { target.0 = value; moves = true; }
                        'Y' => { target.1 = value; moves = true; }
                        'F' => self.feed = value,
                        _ => return "error:20\r\n".into(),
                    }
                }
                if moves {
                    self.position = target;
                    self.busy = Some(("Run", Instant::now() + self.settings.move_duration));
                }
                ok
            }
            _ => "error:20\r\n".into(),
        }
    }
    pub async fn run<R: AsyncRead, W: AsyncWrite>(mut self, input: R, output: W) {
        let mut input = pin!(input);
        let mut output = pin!(output);
        if self.settings.greeting {
            drop(output.write_all(GREETING).await);
        }
        let mut line = Vec::new();
        loop {
            let value = match input.read_u8().await {
                Ok(value) => value,
                Err(_) => return,
            };
            let reply = match value {
                b'?' => {
                    self.journal.record("?");
                    self.status_report()
                }
                0x18 => {
                    self.busy = None;
                    String::from_utf8_lossy(GREETING).into_owned()
                }
                b'\r' => continue,
                b'\n' => {
                    let command = String::from_utf8_lossy(&line).trim().to_string();
                    line.clear();
                    if command.is_empty() {
                        "ok\r\n".to_string()
                    } else {
                        if self.settings.hang_up_at == Some(self.lines_seen) {
                            debug!("simulator hanging up on {:?}", command);
                            return;
                        }
                        self.lines_seen += 1;
                        self.journal.record(&command);
                        self.execute(&command).await
                    }
                }
                other => {
                    line.push(other);
                    continue;
                }
            };
            if output.write_all(reply.as_bytes()).await.is_err() {
                return;
            }
        }
    }
}
