/*!
 * SERIALINK Bluetooth Serial Console
 * Scan, connect and talk to one serial device through serialinkd
 */

use anyhow::Result;
use clap::Parser;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{backend::CrosstermBackend, Terminal};
use std::io;
use tokio::time::{interval, Duration};
use tui_input::InputRequest;

mod app;
mod client;
mod ui;

use app::App;
use ui::render_ui;

#[derive(Parser)]
#[command(name = "serialink")]
#[command(about = "SERIALINK Bluetooth Serial Console")]
struct Cli {
    /// Daemon socket path
    #[arg(short, long, default_value = "/run/serialink/serialink.sock")]
    socket: String,

    /// Send lines without a trailing CR LF
    #[arg(long)]
    no_crlf: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Connect before touching the terminal so errors stay readable
    let mut app = App::new(&cli.socket, !cli.no_crlf).await?;

    // Initialize terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    // Create ticker for UI updates
    let mut ticker = interval(Duration::from_millis(100));

    let result = loop {
        // Handle events
        if event::poll(Duration::from_millis(0))? {
            if let Event::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                let handled = if app.is_editing() {
                    handle_editing_key(&mut app, key.code).await.map(|_| false)
                } else {
                    handle_key(&mut app, key.code).await
                };
                match handled {
                    Ok(true) => break Ok(()),
                    Ok(false) => {}
                    Err(e) => break Err(e),
                }
            }
        }

        // Pick up daemon output
        ticker.tick().await;
        app.poll_daemon();

        // Render UI
        terminal.draw(|f| render_ui(f, &app))?;
    };

    // Restore terminal
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    result
}

/// Returns true when the user asked to quit.
async fn handle_key(app: &mut App, code: KeyCode) -> Result<bool> {
    match code {
        KeyCode::Char('q') => return Ok(true),
        KeyCode::Up => app.previous_device(),
        KeyCode::Down => app.next_device(),
        KeyCode::Enter => app.connect_selected().await?,
        KeyCode::Char('s') => app.toggle_scan().await?,
        KeyCode::Char('d') => app.disconnect().await?,
        KeyCode::Char('i') | KeyCode::Tab => app.start_editing(),
        _ => {}
    }
    Ok(false)
}

async fn handle_editing_key(app: &mut App, code: KeyCode) -> Result<()> {
    match code {
        KeyCode::Esc | KeyCode::Tab => app.stop_editing(),
        KeyCode::Enter => app.send_line().await?,
        KeyCode::Char(c) => app.edit(InputRequest::InsertChar(c)),
        KeyCode::Backspace => app.edit(InputRequest::DeletePrevChar),
        KeyCode::Delete => app.edit(InputRequest::DeleteNextChar),
        KeyCode::Left => app.edit(InputRequest::GoToPrevChar),
        KeyCode::Right => app.edit(InputRequest::GoToNextChar),
        KeyCode::Home => app.edit(InputRequest::GoToStart),
        KeyCode::End => app.edit(InputRequest::GoToEnd),
        _ => {}
    }
    Ok(())
}
