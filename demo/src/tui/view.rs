//! TUI rendering with ratatui.

use fbas::Phase;
use ratatui::{
    Frame,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
};

use super::app::App;
use crate::{participant::ParticipantView, status::DriverStatus};

/// Minimum width for each participant panel.
const MIN_PANEL_WIDTH: u16 = 26;

/// Width of the decision history column.
const HISTORY_WIDTH: u16 = 24;

/// Renders the application state to the terminal.
pub fn render(frame: &mut Frame<'_>, app: &App) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0)])
        .split(frame.area());
    render_header(frame, rows[0], app.status());

    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Min(0), Constraint::Length(HISTORY_WIDTH)])
        .split(rows[1]);
    render_participants_grid(frame, columns[0], app.views(), app.selected());
    render_history(frame, columns[1], app.status());
}

/// Renders participants in a grid layout based on available width.
fn render_participants_grid(
    frame: &mut Frame<'_>,
    area: Rect,
    views: &[ParticipantView],
    selected: usize,
) {
    if views.is_empty() {
        return;
    }

    let cols_per_row = ((area.width / MIN_PANEL_WIDTH).max(1) as usize).min(views.len());
    let num_rows = views.len().div_ceil(cols_per_row);

    let row_constraints: Vec<Constraint> =
        (0..num_rows).map(|_| Constraint::Ratio(1, num_rows as u32)).collect();
    let row_chunks =
        Layout::default().direction(Direction::Vertical).constraints(row_constraints).split(area);

    let grid = views.chunks(cols_per_row).zip(row_chunks.iter()).enumerate();
    for (row, (row_views, row_area)) in grid {
        let col_constraints: Vec<Constraint> =
            row_views.iter().map(|_| Constraint::Ratio(1, row_views.len() as u32)).collect();
        let col_chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints(col_constraints)
            .split(*row_area);

        for (col, (view, cell)) in row_views.iter().zip(col_chunks.iter()).enumerate() {
            render_participant(frame, *cell, view, row * cols_per_row + col == selected);
        }
    }
}

/// Renders the header showing driver activity.
fn render_header(frame: &mut Frame<'_>, area: Rect, status: &DriverStatus) {
    let block = Block::default()
        .title(" fbas demo - what's for lunch? ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    let inner_area = block.inner(area);
    frame.render_widget(block, area);

    let status_line = Line::from(vec![
        Span::styled("Decided through day ", Style::default().fg(Color::DarkGray)),
        Span::styled(
            status.decided_through.to_string(),
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ),
        Span::raw("  "),
        Span::styled(&status.action, Style::default().fg(Color::Yellow)),
        Span::raw("  "),
        Span::styled(
            "[1-9/space] toggle  [arrows] select  [q] quit",
            Style::default().fg(Color::DarkGray),
        ),
    ]);

    frame.render_widget(Paragraph::new(status_line), inner_area);
}

/// Renders the recent decisions.
fn render_history(frame: &mut Frame<'_>, area: Rect, status: &DriverStatus) {
    let block = Block::default().title(" Lunches ").borders(Borders::ALL);
    let inner_area = block.inner(area);
    frame.render_widget(block, area);

    let lines: Vec<Line<'_>> = status
        .history
        .iter()
        .rev()
        .map(|(day, food)| {
            Line::from(vec![
                Span::styled(format!("day {day:>3} "), Style::default().fg(Color::DarkGray)),
                Span::styled(food.to_string(), Style::default().add_modifier(Modifier::BOLD)),
            ])
        })
        .collect();
    frame.render_widget(Paragraph::new(lines), inner_area);
}

const fn phase_color(phase: Option<Phase>) -> Color {
    match phase {
        None => Color::DarkGray,
        Some(Phase::Nominate) => Color::Blue,
        Some(Phase::Prepare) => Color::Yellow,
        Some(Phase::Commit) => Color::Magenta,
        Some(Phase::Externalize) => Color::Green,
    }
}

/// Renders a single participant panel.
fn render_participant(frame: &mut Frame<'_>, area: Rect, view: &ParticipantView, selected: bool) {
    let border_color = if !view.online {
        Color::Red
    } else if view.is_leader {
        Color::Green
    } else {
        Color::Gray
    };

    let (title, border_style) = if selected {
        (format!(">P{}< ", view.id), Style::default().fg(border_color).add_modifier(Modifier::BOLD))
    } else {
        (format!(" P{} ", view.id), Style::default().fg(border_color))
    };
    let block = Block::default().title(title).borders(Borders::ALL).border_style(border_style);

    let inner_area = block.inner(area);
    frame.render_widget(block, area);

    let role = match (view.online, view.is_leader) {
        (false, _) => Span::styled("OFFLINE", Style::default().fg(Color::Red)),
        (true, true) => Span::styled(
            "LEADER",
            Style::default().fg(Color::Green).add_modifier(Modifier::BOLD),
        ),
        (true, false) => Span::styled("Validator", Style::default().fg(Color::Gray)),
    };
    let phase = view.phase.map_or_else(|| "-".to_string(), |p| p.to_string());
    let ballot = view.ballot.as_ref().map_or_else(|| "-".to_string(), ToString::to_string);
    let last = view
        .last
        .map_or_else(|| "nothing yet".to_string(), |(day, food)| format!("day {day}: {food}"));

    let lines = vec![
        Line::from(role),
        Line::from(vec![
            Span::styled("Day: ", Style::default().fg(Color::DarkGray)),
            Span::styled(view.day.to_string(), Style::default().add_modifier(Modifier::BOLD)),
            Span::raw(" "),
            Span::styled(phase, Style::default().fg(phase_color(view.phase))),
        ]),
        Line::from(vec![
            Span::styled("Ballot: ", Style::default().fg(Color::DarkGray)),
            Span::raw(ballot),
        ]),
        Line::from(vec![
            Span::styled("Ate: ", Style::default().fg(Color::DarkGray)),
            Span::raw(last),
        ]),
    ];

    frame.render_widget(Paragraph::new(lines), inner_area);
}
