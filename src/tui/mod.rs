//! Thin terminal dashboard (ambient component N): a single-screen table of
//! live sessions, refreshed on `display.refresh_rate_ms` and color-coded via
//! `display.color_thresholds`. Grounded on the teacher-adjacent `ccboard-tui`
//! crate's `run`/`run_loop` shape (raw-mode setup, `event::poll` timeout,
//! `terminal.draw`), cut down to one table instead of a tabbed app.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use ratatui::prelude::*;
use ratatui::widgets::{Block, Borders, Cell, Row, Table};

use crate::config::DisplayConfig;
use crate::db::DurableStore;
use crate::types::{Session, SessionStatus};

/// Run the dashboard until the user presses `q` or Ctrl-C. Errors bubble up
/// as `anyhow::Error` to the binary's `main`.
pub async fn run(store: Arc<DurableStore>, config: DisplayConfig) -> anyhow::Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run_loop(&mut terminal, &store, &config).await;

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    result
}

async fn run_loop<B: Backend>(
    terminal: &mut Terminal<B>,
    store: &Arc<DurableStore>,
    config: &DisplayConfig,
) -> anyhow::Result<()> {
    let refresh = Duration::from_millis(config.refresh_rate_ms.max(1));
    loop {
        let mut sessions = store.list_sessions();
        sessions.sort_by(|a, b| b.total_cost.partial_cmp(&a.total_cost).unwrap_or(std::cmp::Ordering::Equal));
        sessions.truncate(config.buffer_size);

        terminal.draw(|f| render(f, &sessions, config))?;

        if event::poll(refresh)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press && matches!(key.code, KeyCode::Char('q') | KeyCode::Esc) {
                    return Ok(());
                }
            }
        }
    }
}

fn cost_color(cost: f64, thresholds: &std::collections::HashMap<String, f64>) -> Color {
    let warn = thresholds.get("cost_warn").copied().unwrap_or(1.0);
    let critical = thresholds.get("cost_critical").copied().unwrap_or(5.0);
    if cost >= critical {
        Color::Red
    } else if cost >= warn {
        Color::Yellow
    } else {
        Color::Green
    }
}

fn status_color(status: SessionStatus) -> Color {
    match status {
        SessionStatus::Active => Color::Green,
        SessionStatus::Idle => Color::Yellow,
        SessionStatus::Exited | SessionStatus::Done => Color::DarkGray,
    }
}

fn render(frame: &mut Frame, sessions: &[Session], config: &DisplayConfig) {
    let now = chrono::Utc::now();
    let header = Row::new(vec!["Session", "Status", "Model", "Cost", "Tokens", "Active"])
        .style(Style::default().add_modifier(Modifier::BOLD));

    let rows: Vec<Row> = sessions
        .iter()
        .map(|s| {
            let status = s.status(now);
            Row::new(vec![
                Cell::from(short_id(&s.session_id)),
                Cell::from(status.to_string()).style(Style::default().fg(status_color(status))),
                Cell::from(s.model.clone().unwrap_or_else(|| "-".to_string())),
                Cell::from(format!("${:.2}", s.total_cost))
                    .style(Style::default().fg(cost_color(s.total_cost, &config.color_thresholds))),
                Cell::from(s.total_tokens.to_string()),
                Cell::from(format!("{:.0}s", s.active_time_secs)),
            ])
        })
        .collect();

    let widths = [
        Constraint::Length(10),
        Constraint::Length(8),
        Constraint::Length(16),
        Constraint::Length(10),
        Constraint::Length(12),
        Constraint::Length(10),
    ];

    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title("ccpulse — live sessions (q to quit)"));

    frame.render_widget(table, frame.area());
}

fn short_id(session_id: &str) -> String {
    session_id.chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_color_escalates_with_thresholds() {
        let mut thresholds = std::collections::HashMap::new();
        thresholds.insert("cost_warn".to_string(), 1.0);
        thresholds.insert("cost_critical".to_string(), 5.0);
        assert_eq!(cost_color(0.5, &thresholds), Color::Green);
        assert_eq!(cost_color(2.0, &thresholds), Color::Yellow);
        assert_eq!(cost_color(10.0, &thresholds), Color::Red);
    }

    #[test]
    fn short_id_truncates_to_eight_chars() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }
}
