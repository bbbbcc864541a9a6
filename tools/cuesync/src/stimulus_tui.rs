use crate::errors::CuesyncError;
use crate::logging::append_run_log;
use crate::runtime::Clock;
use crate::stimulus::{Stimulus, StimulusSink};
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::{Backend, CrosstermBackend, TestBackend};
use ratatui::layout::{Alignment, Rect};
use ratatui::style::{Color, Style};
use ratatui::text::Line;
use ratatui::widgets::{Paragraph, Wrap};
use ratatui::{Frame, Terminal};
use serde_json::json;
use std::io::{BufRead, Stdout, Write};
use std::sync::Arc;
use std::time::Duration;

const FIXATION_GLYPH: &str = "+";
const TARGET_GLYPH: &str = "●";
const KEY_POLL: Duration = Duration::from_millis(20);

fn sink_err(error: impl std::fmt::Display) -> CuesyncError {
    CuesyncError::StimulusSink(error.to_string())
}

/// Map a normalized position (`-1..=1`, y up) onto a cell inside `area`.
pub fn cell_for(position: [f32; 2], area: Rect) -> (u16, u16) {
    let half_w = f32::from(area.width.saturating_sub(1)) / 2.0;
    let half_h = f32::from(area.height.saturating_sub(1)) / 2.0;
    let x = half_w + position[0].clamp(-1.0, 1.0) * half_w;
    let y = half_h - position[1].clamp(-1.0, 1.0) * half_h;
    (
        area.x + x.round() as u16,
        area.y + y.round() as u16,
    )
}

fn draw_stimulus(frame: &mut Frame<'_>, stimulus: &Stimulus) {
    let area = frame.area();
    match stimulus {
        Stimulus::Text { text } => {
            let lines = text.lines().count().max(1) as u16;
            let top = area.y + area.height.saturating_sub(lines) / 2;
            let body = Rect::new(area.x, top, area.width, lines.min(area.height));
            frame.render_widget(
                Paragraph::new(text.as_str())
                    .alignment(Alignment::Center)
                    .wrap(Wrap { trim: true }),
                body,
            );
        }
        Stimulus::Fixation => draw_glyph(frame, [0.0, 0.0], FIXATION_GLYPH, Color::White),
        Stimulus::Target {
            position,
            with_fixation,
        } => {
            if *with_fixation {
                draw_glyph(frame, [0.0, 0.0], FIXATION_GLYPH, Color::White);
            }
            draw_glyph(frame, *position, TARGET_GLYPH, Color::Red);
        }
    }
}

fn draw_glyph(frame: &mut Frame<'_>, position: [f32; 2], glyph: &str, color: Color) {
    let area = frame.area();
    if area.width == 0 || area.height == 0 {
        return;
    }
    let (x, y) = cell_for(position, area);
    frame.render_widget(
        Paragraph::new(Line::styled(glyph, Style::default().fg(color))),
        Rect::new(x, y, 1, 1),
    );
}

/// Render one stimulus into a plain-text grid, one line per terminal row.
pub fn render_stimulus_frame(
    stimulus: &Stimulus,
    width: u16,
    height: u16,
) -> Result<String, CuesyncError> {
    let backend = TestBackend::new(width, height);
    let mut terminal = Terminal::new(backend).map_err(sink_err)?;
    terminal
        .draw(|frame| draw_stimulus(frame, stimulus))
        .map_err(sink_err)?;

    let buffer = terminal.backend().buffer().clone();
    let mut out = String::new();
    for y in 0..height {
        for x in 0..width {
            out.push_str(buffer[(x, y)].symbol());
        }
        out.push('\n');
    }
    Ok(out)
}

/// Full-screen sink for an operator terminal: raw mode, alternate screen, bell
/// for tones. Esc or Ctrl-C while waiting aborts the session.
pub struct TerminalStimulusSink {
    terminal: Terminal<CrosstermBackend<Stdout>>,
    clock: Arc<dyn Clock>,
}

impl TerminalStimulusSink {
    pub fn open(clock: Arc<dyn Clock>) -> Result<Self, CuesyncError> {
        enable_raw_mode().map_err(sink_err)?;
        let mut stdout = std::io::stdout();
        if let Err(error) = execute!(stdout, EnterAlternateScreen) {
            let _ = disable_raw_mode();
            return Err(sink_err(error));
        }
        let mut terminal = Terminal::new(CrosstermBackend::new(stdout)).map_err(sink_err)?;
        terminal.hide_cursor().map_err(sink_err)?;
        terminal.clear().map_err(sink_err)?;
        append_run_log("info", "stimulus.terminal.opened", json!({}));
        Ok(Self { terminal, clock })
    }

    fn check_abort(&mut self, timeout: Duration) -> Result<Option<KeyCode>, CuesyncError> {
        if !event::poll(timeout).map_err(sink_err)? {
            return Ok(None);
        }
        match event::read().map_err(sink_err)? {
            Event::Key(key) if key.kind == KeyEventKind::Press => {
                let ctrl_c = key.code == KeyCode::Char('c')
                    && key.modifiers.contains(KeyModifiers::CONTROL);
                if key.code == KeyCode::Esc || ctrl_c {
                    return Err(CuesyncError::StimulusSink(
                        "operator aborted the session".to_string(),
                    ));
                }
                Ok(Some(key.code))
            }
            Event::Resize(_, _) => {
                self.terminal.autoresize().map_err(sink_err)?;
                Ok(None)
            }
            _ => Ok(None),
        }
    }
}

impl StimulusSink for TerminalStimulusSink {
    fn present(&mut self, stimulus: &Stimulus) -> Result<(), CuesyncError> {
        self.terminal
            .draw(|frame| draw_stimulus(frame, stimulus))
            .map(|_| ())
            .map_err(sink_err)
    }

    fn play_tone(&mut self, _frequency_hz: f64, _seconds: f64) -> Result<(), CuesyncError> {
        let backend = self.terminal.backend_mut();
        backend.write_all(b"\x07").map_err(sink_err)?;
        Backend::flush(backend).map_err(sink_err)
    }

    fn wait_for_operator_key(&mut self) -> Result<(), CuesyncError> {
        // keys pressed during the previous phase must not pass the gate
        self.poll_abort()?;
        loop {
            if self.check_abort(Duration::from_secs(3600))?.is_some() {
                return Ok(());
            }
        }
    }

    fn wait_seconds(&mut self, seconds: f64) -> Result<(), CuesyncError> {
        let deadline = self.clock.now().after(seconds);
        loop {
            let remaining = deadline - self.clock.now();
            if remaining <= 0.0 {
                return Ok(());
            }
            let slice = Duration::from_secs_f64(remaining).min(KEY_POLL);
            self.check_abort(slice)?;
        }
    }

    fn poll_abort(&mut self) -> Result<(), CuesyncError> {
        while event::poll(Duration::ZERO).map_err(sink_err)? {
            self.check_abort(Duration::ZERO)?;
        }
        Ok(())
    }
}

impl Drop for TerminalStimulusSink {
    fn drop(&mut self) {
        let _ = self.terminal.show_cursor();
        let _ = execute!(self.terminal.backend_mut(), LeaveAlternateScreen);
        let _ = disable_raw_mode();
    }
}

/// Line-oriented fallback for a non-TTY stdin: one line per stimulus, a line on
/// the input acknowledges the operator gate.
pub struct LineStimulusSink<R, W> {
    input: R,
    output: W,
    clock: Arc<dyn Clock>,
}

impl<R: BufRead, W: Write> LineStimulusSink<R, W> {
    pub fn new(input: R, output: W, clock: Arc<dyn Clock>) -> Self {
        Self {
            input,
            output,
            clock,
        }
    }

    pub fn into_output(self) -> W {
        self.output
    }

    fn line(&mut self, text: &str) -> Result<(), CuesyncError> {
        writeln!(self.output, "{text}")
            .and_then(|_| self.output.flush())
            .map_err(sink_err)
    }
}

impl<R: BufRead, W: Write> StimulusSink for LineStimulusSink<R, W> {
    fn present(&mut self, stimulus: &Stimulus) -> Result<(), CuesyncError> {
        let text = match stimulus {
            Stimulus::Text { text } => format!("[stimulus] {}", text.replace('\n', " / ")),
            Stimulus::Fixation => "[stimulus] fixation".to_string(),
            Stimulus::Target {
                position,
                with_fixation,
            } => format!(
                "[stimulus] target x={:.2} y={:.2}{}",
                position[0],
                position[1],
                if *with_fixation { " +fixation" } else { "" }
            ),
        };
        self.line(&text)
    }

    fn play_tone(&mut self, frequency_hz: f64, seconds: f64) -> Result<(), CuesyncError> {
        self.line(&format!("[tone] {frequency_hz:.0}Hz {seconds:.2}s"))
    }

    fn wait_for_operator_key(&mut self) -> Result<(), CuesyncError> {
        self.line("[operator] press Enter to continue")?;
        let mut buf = String::new();
        let read = self.input.read_line(&mut buf).map_err(sink_err)?;
        if read == 0 {
            return Err(CuesyncError::StimulusSink(
                "operator input closed".to_string(),
            ));
        }
        Ok(())
    }

    fn wait_seconds(&mut self, seconds: f64) -> Result<(), CuesyncError> {
        self.clock.sleep_for(seconds)
    }
}
