//! Terminal front end: the control loop that snapshots, projects, draws and
//! ages once per refresh.

pub mod render;

use std::io::{self, Stdout};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::{Backend, CrosstermBackend};
use ratatui::Terminal;
use tracing::{debug, info};

use crate::error::ControlError;
use crate::heatmap::{GridSize, Projector};
use crate::monitor::Monitor;
use crate::tracer::ReaderExit;
use crate::tracker::RecordView;

use self::render::{Header, CHROME_ROWS};

/// Below this the screen cannot show anything useful and the loop aborts.
pub const HARD_MIN_WIDTH: u16 = 23;
pub const HARD_MIN_HEIGHT: u16 = 1;

/// Set while the terminal is in raw mode on the alternate screen.
static TERMINAL_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Owns the real terminal; restores it on drop.
pub struct TerminalGuard {
    terminal: Terminal<CrosstermBackend<Stdout>>,
}

impl TerminalGuard {
    /// Switch to raw mode and the alternate screen.
    pub fn enter() -> io::Result<Self> {
        enable_raw_mode()?;
        TERMINAL_ACTIVE.store(true, Ordering::SeqCst);

        let mut stdout = io::stdout();
        if let Err(e) = execute!(stdout, EnterAlternateScreen) {
            restore_terminal();
            return Err(e);
        }

        let terminal = match Terminal::new(CrosstermBackend::new(stdout)) {
            Ok(t) => t,
            Err(e) => {
                restore_terminal();
                return Err(e);
            }
        };
        let mut guard = Self { terminal };
        guard.terminal.hide_cursor()?;
        guard.terminal.clear()?;

        Ok(guard)
    }

    pub fn terminal_mut(&mut self) -> &mut Terminal<CrosstermBackend<Stdout>> {
        &mut self.terminal
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        restore_terminal();
    }
}

/// Leave the alternate screen, disable raw mode and show the cursor.
///
/// Safe to call more than once and from a panic hook; only the first call
/// after [`TerminalGuard::enter`] does anything.
pub fn restore_terminal() {
    if !TERMINAL_ACTIVE.swap(false, Ordering::SeqCst) {
        return;
    }
    let _ = disable_raw_mode();
    let _ = execute!(io::stdout(), LeaveAlternateScreen, crossterm::cursor::Show);
}

/// Restore the terminal before the previously installed hook prints the
/// panic message, so the report is readable.
///
/// Must be called from the thread that runs the control loop. Panics on other
/// threads leave the terminal alone; the control loop notices their effects
/// and exits through [`TerminalGuard`].
pub fn install_panic_hook() {
    let ui_thread = std::thread::current().id();
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        if std::thread::current().id() == ui_thread {
            restore_terminal();
        }
        previous(info);
    }));
}

/// User commands bound to keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    ToggleHelp,
    ClearPopups,
    Quit,
}

/// Map a key press to a command.
pub fn command_for(key: KeyEvent) -> Option<Command> {
    if key.kind != KeyEventKind::Press {
        return None;
    }
    match key.code {
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => Some(Command::Quit),
        KeyCode::Char('h') | KeyCode::Char('?') => Some(Command::ToggleHelp),
        KeyCode::Char('c') | KeyCode::Char('C') => Some(Command::ClearPopups),
        KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => Some(Command::Quit),
        _ => None,
    }
}

/// What a single cycle drew.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Heatmap { active_cells: usize },
    TooSmall,
}

/// Per-frame state of the control loop.
pub struct ControlLoop<'a, B: Backend> {
    monitor: &'a Monitor,
    terminal: &'a mut Terminal<B>,
    projector: Projector,
    records: Vec<RecordView>,
    show_help: bool,
}

impl<'a, B: Backend> ControlLoop<'a, B> {
    pub fn new(monitor: &'a Monitor, terminal: &'a mut Terminal<B>) -> Self {
        Self {
            projector: Projector::new(monitor.config().heatmap.tiers),
            records: Vec::with_capacity(monitor.config().tracker.capacity),
            monitor,
            terminal,
            show_help: false,
        }
    }

    pub fn show_help(&self) -> bool {
        self.show_help
    }

    /// Apply one terminal event. Returns true when the user asked to quit.
    pub fn handle_event(&mut self, ev: &Event) -> bool {
        let Event::Key(key) = ev else {
            // Resizes are picked up by the size check at the top of each cycle.
            return false;
        };
        match command_for(*key) {
            Some(Command::ToggleHelp) => self.show_help = !self.show_help,
            Some(Command::ClearPopups) => self.show_help = false,
            Some(Command::Quit) => return true,
            None => {}
        }
        false
    }

    /// Render one frame and run one aging tick.
    pub fn cycle(&mut self) -> Result<FrameKind, ControlError> {
        let size = self.terminal.size().map_err(ControlError::SizeQuery)?;
        if size.width < HARD_MIN_WIDTH || size.height < HARD_MIN_HEIGHT {
            return Err(ControlError::WindowTooSmall {
                width: size.width,
                height: size.height,
            });
        }

        let monitor = self.monitor;
        let heatmap_cfg = &monitor.config().heatmap;
        let tracker = monitor.tracker();
        let health = monitor.health();
        let started = Instant::now();

        let drawn = if size.width < heatmap_cfg.min_width || size.height < heatmap_cfg.min_height {
            self.terminal.draw(render::draw_too_small)?;
            FrameKind::TooSmall
        } else {
            tracker.snapshot_into(&mut self.records);
            let grid = GridSize::new(size.width, size.height.saturating_sub(CHROME_ROWS));
            let device = *monitor.device();
            let map = self.projector.project(&self.records, device.total_blocks, grid);

            let header = Header {
                device,
                live_records: self.records.len(),
                active_percent: map.active_percent(),
            };
            let show_help = self.show_help;
            self.terminal
                .draw(|f| render::draw_frame(f, &header, &map, show_help))?;

            if let Some(h) = health {
                h.heatmap_active_cells.set(map.active_cells() as f64);
                h.frame_duration.observe(started.elapsed().as_secs_f64());
            }
            FrameKind::Heatmap {
                active_cells: map.active_cells(),
            }
        };

        // Ages every cycle, placeholder or not.
        let sweep_started = Instant::now();
        let report = tracker.age_tick();
        if let Some(h) = health {
            h.age_sweep_duration
                .observe(sweep_started.elapsed().as_secs_f64());
            h.tracker_evictions.inc_by(report.evicted as f64);
            h.tracker_records.set(report.live as f64);
        }

        Ok(drawn)
    }
}

/// Decide whether the loop should leave after ingestion stopped.
///
/// Returns `Ok(true)` to leave normally, `Ok(false)` to keep running.
pub fn check_ingestion(exit: Option<ReaderExit>) -> Result<bool, ControlError> {
    match exit {
        None => Ok(false),
        Some(ReaderExit::Failed) => Err(ControlError::IngestionFailed),
        Some(ReaderExit::EndOfStream | ReaderExit::Cancelled) => Ok(true),
    }
}

/// Run the control loop until the user quits, shutdown is requested or the
/// trace stream ends.
pub fn run<B: Backend>(monitor: &Monitor, terminal: &mut Terminal<B>) -> Result<(), ControlError> {
    let cancel = monitor.cancel_token();
    let delay: Duration = monitor.config().refresh_delay;
    let mut ui = ControlLoop::new(monitor, terminal);

    loop {
        while event::poll(Duration::ZERO)? {
            let ev = event::read()?;
            if ui.handle_event(&ev) {
                info!("quit requested");
                return Ok(());
            }
        }

        let frame = ui.cycle()?;
        debug!(?frame, "frame drawn");

        if cancel.is_cancelled() {
            info!("shutdown requested");
            return Ok(());
        }
        if check_ingestion(monitor.ingestion_exit())? {
            info!("trace stream finished, leaving");
            return Ok(());
        }

        std::thread::sleep(delay);
    }
}
