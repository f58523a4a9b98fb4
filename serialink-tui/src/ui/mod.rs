/*!
 * SERIALINK TUI Interface
 * Devices on the left; connection, serial log and input line on the right
 */

use ratatui::{
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, Paragraph},
    Frame,
};

use crate::app::{App, Direction as LogDirection, FocusedPanel};

// Conservative color palette
const BLUE: Color = Color::Rgb(100, 149, 237);
const GRAY: Color = Color::Rgb(128, 128, 128);
const WHITE: Color = Color::Rgb(255, 255, 255);
const GREEN: Color = Color::Rgb(34, 139, 34);
const RED: Color = Color::Rgb(220, 20, 60);

pub fn render_ui(f: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(35), // Devices
            Constraint::Percentage(65), // Connection + console
        ])
        .split(f.area());

    let right = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(7), // Connection
            Constraint::Min(5),    // Serial log
            Constraint::Length(3), // Input line
        ])
        .split(chunks[1]);

    render_devices_panel(f, chunks[0], app);
    render_connection_panel(f, right[0], app);
    render_serial_log(f, right[1], app);
    render_input_line(f, right[2], app);
}

fn border_style(app: &App, panel: FocusedPanel) -> Style {
    if app.focused_panel == panel {
        Style::default().fg(BLUE)
    } else {
        Style::default().fg(GRAY)
    }
}

fn render_devices_panel(f: &mut Frame, area: Rect, app: &App) {
    let title = if app.scanning {
        "Devices (scanning)"
    } else {
        "Devices"
    };

    let connected_to = app.connection.as_ref().map(|c| c.device.as_str());
    let items: Vec<ListItem> = app
        .devices
        .iter()
        .enumerate()
        .map(|(i, device)| {
            let prefix = if i == app.selected_device { "▶ " } else { "  " };
            let (marker, marker_color) = if connected_to == Some(device.name.as_str()) {
                ("●", GREEN)
            } else {
                ("○", GRAY)
            };

            let content = Line::from(vec![
                Span::raw(prefix),
                Span::styled(marker, Style::default().fg(marker_color)),
                Span::raw(" "),
                Span::styled(&device.name, Style::default().fg(WHITE)),
                Span::raw(" "),
                Span::styled(&device.address, Style::default().fg(GRAY)),
            ]);

            if i == app.selected_device {
                ListItem::new(content).style(Style::default().bg(BLUE).fg(WHITE))
            } else {
                ListItem::new(content)
            }
        })
        .collect();

    if items.is_empty() {
        let hint = if app.scanning {
            "Waiting for devices..."
        } else {
            "Press [s] to scan"
        };
        let paragraph = Paragraph::new(hint)
            .style(Style::default().fg(GRAY))
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(title)
                    .border_style(border_style(app, FocusedPanel::Devices)),
            )
            .alignment(Alignment::Center);
        f.render_widget(paragraph, area);
        return;
    }

    let list = List::new(items).block(
        Block::default()
            .borders(Borders::ALL)
            .title(title)
            .border_style(border_style(app, FocusedPanel::Devices)),
    );

    f.render_widget(list, area);
}

fn render_connection_panel(f: &mut Frame, area: Rect, app: &App) {
    let (symbol, color) = if app.indicator.is_connected() {
        ("●", GREEN)
    } else {
        ("○", RED)
    };

    let device = match &app.connection {
        Some(connection) => format!(
            "{} since {}",
            connection.device,
            connection.since.format("%H:%M:%S")
        ),
        None => "None".to_string(),
    };

    let mut content = vec![
        Line::from(vec![
            Span::styled(format!("{} ", symbol), Style::default().fg(color)),
            Span::styled(
                &app.indicator.text,
                Style::default().fg(color).add_modifier(Modifier::BOLD),
            ),
        ]),
        Line::from(vec![
            Span::styled("Device: ", Style::default().fg(GRAY)),
            Span::styled(device, Style::default().fg(WHITE)),
        ]),
    ];

    if let Some(error) = &app.last_error {
        content.push(Line::from(vec![
            Span::styled("Error: ", Style::default().fg(GRAY)),
            Span::styled(error, Style::default().fg(RED)),
        ]));
    } else {
        content.push(Line::from(""));
    }

    content.push(Line::from(""));
    content.push(Line::from(Span::styled(
        "[s] Scan  [Enter] Connect  [d] Disconnect  [i] Type  [q] Quit",
        Style::default().fg(GRAY),
    )));

    let paragraph = Paragraph::new(content)
        .block(Block::default().borders(Borders::ALL).title("Connection"))
        .alignment(Alignment::Left);

    f.render_widget(paragraph, area);
}

fn render_serial_log(f: &mut Frame, area: Rect, app: &App) {
    // Newest lines at the bottom
    let visible = area.height.saturating_sub(2) as usize;
    let skip = app.serial_log.len().saturating_sub(visible);

    let lines: Vec<Line> = app
        .serial_log
        .iter()
        .skip(skip)
        .map(|entry| {
            let (tag, color) = match entry.direction {
                LogDirection::Rx => ("<- ", GREEN),
                LogDirection::Tx => ("-> ", BLUE),
                LogDirection::Info => ("-- ", GRAY),
            };
            Line::from(vec![
                Span::styled(entry.time.format("%H:%M:%S ").to_string(), Style::default().fg(GRAY)),
                Span::styled(tag, Style::default().fg(color)),
                Span::styled(&entry.text, Style::default().fg(WHITE)),
            ])
        })
        .collect();

    let paragraph = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Serial"));

    f.render_widget(paragraph, area);
}

fn render_input_line(f: &mut Frame, area: Rect, app: &App) {
    let width = area.width.saturating_sub(2) as usize;
    let scroll = app.input.visual_scroll(width);

    let paragraph = Paragraph::new(app.input.value())
        .style(Style::default().fg(WHITE))
        .scroll((0, scroll as u16))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title("Write [Enter] send, [Esc] back")
                .border_style(border_style(app, FocusedPanel::Console)),
        );

    f.render_widget(paragraph, area);

    if app.is_editing() {
        let cursor = app.input.visual_cursor().saturating_sub(scroll) as u16;
        f.set_cursor_position((area.x + 1 + cursor, area.y + 1));
    }
}
