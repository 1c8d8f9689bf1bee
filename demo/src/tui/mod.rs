//! Terminal front end for the lunch room.

mod app;
mod input;
mod view;

use std::{
    io::{self, Stdout},
    time::Duration,
};

pub use app::App;
use crossterm::{
    event::{self, Event},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{Terminal, backend::CrosstermBackend};

/// Redraw interval while no key is pressed.
const FRAME: Duration = Duration::from_millis(100);

/// Raw-mode alternate screen, restored on drop.
struct Screen {
    terminal: Terminal<CrosstermBackend<Stdout>>,
}

impl Screen {
    fn enter() -> io::Result<Self> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen)?;
        Ok(Self { terminal: Terminal::new(CrosstermBackend::new(stdout))? })
    }
}

impl Drop for Screen {
    fn drop(&mut self) {
        // Best effort: the terminal may already be gone.
        let _ = disable_raw_mode();
        let _ = execute!(self.terminal.backend_mut(), LeaveAlternateScreen);
        let _ = self.terminal.show_cursor();
    }
}

/// Draws the lunch room until the user quits.
pub async fn run(mut app: App) -> io::Result<()> {
    let mut screen = Screen::enter()?;

    while !app.should_quit() {
        app.refresh().await;
        screen.terminal.draw(|frame| view::render(frame, &app))?;

        if event::poll(FRAME)? {
            if let Ok(key @ Event::Key(_)) = event::read() {
                input::handle_event(&mut app, key);
            }
        }
    }

    Ok(())
}
