use crate::service::Dashboard;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span, Text},
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph},
};
use taskdeck_core::TaskStatus;
use taskdeck_engine::{Control, TaskNode};

const COMPACT_WIDTH: u16 = 96;

#[derive(Clone, Copy)]
struct DeckTheme {
    bg: Color,
    surface: Color,
    border: Color,
    title: Color,
    text: Color,
    muted: Color,
    accent: Color,
    ok: Color,
    warn: Color,
    critical: Color,
    info: Color,
}

fn deck_theme() -> DeckTheme {
    DeckTheme {
        bg: Color::Rgb(11, 18, 32),
        surface: Color::Rgb(17, 26, 46),
        border: Color::Rgb(71, 85, 105),
        title: Color::Rgb(191, 219, 254),
        text: Color::Rgb(226, 232, 240),
        muted: Color::Rgb(148, 163, 184),
        accent: Color::Rgb(56, 189, 248),
        ok: Color::Rgb(34, 197, 94),
        warn: Color::Rgb(245, 158, 11),
        critical: Color::Rgb(239, 68, 68),
        info: Color::Rgb(59, 130, 246),
    }
}

pub fn render_ui(frame: &mut ratatui::Frame, dashboard: &Dashboard) {
    let size = frame.size();
    let theme = deck_theme();
    let layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(4),
            Constraint::Min(0),
            Constraint::Length(3),
        ])
        .split(size);
    frame.render_widget(render_header(dashboard, theme), layout[0]);

    if size.width < COMPACT_WIDTH {
        render_task_panel(frame, dashboard, theme, layout[1]);
    } else {
        let body = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(64), Constraint::Percentage(36)])
            .split(layout[1]);
        render_task_panel(frame, dashboard, theme, body[0]);
        frame.render_widget(render_metric_panel(dashboard, theme), body[1]);
    }
    frame.render_widget(render_footer(dashboard, theme), layout[2]);
}

fn panel(title: &str, theme: DeckTheme) -> Block<'static> {
    Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(theme.border))
        .style(Style::default().bg(theme.surface))
        .title(Span::styled(
            title.to_string(),
            Style::default()
                .fg(theme.title)
                .add_modifier(Modifier::BOLD),
        ))
}

fn render_header(dashboard: &Dashboard, theme: DeckTheme) -> Paragraph<'static> {
    let nodes: Vec<&TaskNode> = dashboard.view().nodes().collect();
    let running = nodes
        .iter()
        .filter(|node| node.status == TaskStatus::Running)
        .count();
    let failed = nodes
        .iter()
        .filter(|node| node.status == TaskStatus::Failed)
        .count();
    let push = dashboard.push_summary();
    let push_color = if push.ends_with("live") {
        theme.ok
    } else if push.ends_with("off") {
        theme.muted
    } else {
        theme.warn
    };

    let summary = Line::from(vec![
        Span::styled(format!("Tasks: {}", nodes.len()), Style::default().fg(theme.text)),
        Span::styled(" | ", Style::default().fg(theme.muted)),
        Span::styled(format!("Running: {running}"), Style::default().fg(theme.accent)),
        Span::styled(" | ", Style::default().fg(theme.muted)),
        Span::styled(format!("Failed: {failed}"), Style::default().fg(theme.critical)),
        Span::styled(" | ", Style::default().fg(theme.muted)),
        Span::styled(push.to_string(), Style::default().fg(push_color)),
    ]);
    let system = Line::from(Span::styled(
        dashboard
            .view()
            .system_line()
            .map(|line| format!("Scheduler: {line}"))
            .unwrap_or_else(|| "Scheduler: no metrics yet".to_string()),
        Style::default().fg(theme.muted),
    ));

    Paragraph::new(Text::from(vec![summary, system]))
        .style(Style::default().fg(theme.text).bg(theme.bg))
        .block(panel("taskdeck", theme).style(Style::default().bg(theme.bg)))
}

fn render_task_panel(frame: &mut ratatui::Frame, dashboard: &Dashboard, theme: DeckTheme, area: Rect) {
    let view = dashboard.view();
    if view.is_empty() {
        let paragraph = Paragraph::new(Line::from(Span::styled(
            "No tasks reported by the scheduler yet.",
            Style::default().fg(theme.muted),
        )))
        .style(Style::default().fg(theme.text).bg(theme.surface))
        .block(panel("Tasks", theme));
        frame.render_widget(paragraph, area);
        return;
    }

    let items: Vec<ListItem> = view
        .nodes()
        .map(|node| ListItem::new(Text::from(task_lines(node, theme))))
        .collect();
    let mut state = ListState::default();
    state.select(Some(dashboard.selected()));
    let list = List::new(items)
        .highlight_symbol(">> ")
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED))
        .block(panel("Tasks", theme));
    frame.render_stateful_widget(list, area, &mut state);
}

fn task_lines(node: &TaskNode, theme: DeckTheme) -> Vec<Line<'static>> {
    let mut spans = vec![
        Span::styled(
            format!("{:<9}", node.status.as_str()),
            Style::default()
                .fg(status_color(node.status, theme))
                .add_modifier(Modifier::BOLD),
        ),
        Span::styled(format!(" {} ", node.title), Style::default().fg(theme.text)),
        Span::styled(
            format!("[{}]", node.priority),
            Style::default().fg(theme.info),
        ),
    ];
    if let Some(usage) = &node.usage {
        spans.push(Span::styled(format!("  {usage}"), Style::default().fg(theme.muted)));
    }
    let controls = node
        .controls
        .iter()
        .map(|control| format!("[{}]", control.label()))
        .collect::<Vec<_>>()
        .join(" ");
    spans.push(Span::styled(format!("  {controls}"), Style::default().fg(theme.accent)));

    let mut lines = vec![Line::from(spans)];
    if let Some(error) = &node.error {
        lines.push(Line::from(Span::styled(
            format!("          error: {error}"),
            Style::default().fg(theme.critical),
        )));
    }
    lines
}

fn render_metric_panel(dashboard: &Dashboard, theme: DeckTheme) -> Paragraph<'static> {
    let rows = dashboard.view().metric_rows();
    let lines: Vec<Line<'static>> = if rows.is_empty() {
        vec![Line::from(Span::styled(
            "No process metrics.",
            Style::default().fg(theme.muted),
        ))]
    } else {
        rows.iter()
            .map(|row| {
                Line::from(vec![
                    Span::styled(format!("{:<12}", row.key), Style::default().fg(theme.muted)),
                    Span::styled(format!("{:<14}", row.process_name), Style::default().fg(theme.text)),
                    Span::styled(format!("{:>9}", row.cpu), Style::default().fg(theme.accent)),
                    Span::styled(format!("{:>12}", row.memory), Style::default().fg(theme.info)),
                ])
            })
            .collect()
    };
    Paragraph::new(Text::from(lines))
        .style(Style::default().fg(theme.text).bg(theme.surface))
        .block(panel("Processes", theme))
}

fn render_footer(dashboard: &Dashboard, theme: DeckTheme) -> Paragraph<'static> {
    let line = match dashboard.status_note() {
        Some(note) => Line::from(Span::styled(
            note.to_string(),
            Style::default().fg(status_note_color(note, theme)),
        )),
        None => Line::from(Span::styled(
            "j/k move  p pause/resume  c cancel  d delete  r refresh  q quit",
            Style::default().fg(theme.muted),
        )),
    };
    Paragraph::new(line)
        .style(Style::default().fg(theme.text).bg(theme.bg))
        .block(panel("Last Action", theme).style(Style::default().bg(theme.bg)))
}

fn status_color(status: TaskStatus, theme: DeckTheme) -> Color {
    match status {
        TaskStatus::Running => theme.ok,
        TaskStatus::Pending => theme.info,
        TaskStatus::Paused => theme.warn,
        TaskStatus::Failed => theme.critical,
        TaskStatus::Completed | TaskStatus::Cancelled | TaskStatus::Archived => theme.muted,
    }
}

fn status_note_color(note: &str, theme: DeckTheme) -> Color {
    let normalized = note.to_ascii_lowercase();
    if normalized.contains("failed") || normalized.contains("error") {
        return theme.critical;
    }
    if normalized.contains("not available") {
        return theme.warn;
    }
    theme.info
}

/// Returns true when the dashboard should exit.
pub fn handle_key(key: KeyEvent, dashboard: &mut Dashboard) -> bool {
    if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
        return true;
    }
    match key.code {
        KeyCode::Char('q') | KeyCode::Esc => return true,
        KeyCode::Down | KeyCode::Char('j') => dashboard.move_selection(1),
        KeyCode::Up | KeyCode::Char('k') => dashboard.move_selection(-1),
        KeyCode::Char('g') => dashboard.move_selection(isize::MIN / 2),
        KeyCode::Char('G') => dashboard.move_selection(isize::MAX / 2),
        KeyCode::Char('p') | KeyCode::Char(' ') => dashboard.toggle_selected(),
        KeyCode::Char('c') => dashboard.control_selected(Control::Cancel),
        KeyCode::Char('d') => dashboard.control_selected(Control::Delete),
        KeyCode::Char('r') => {
            let note = if dashboard.refresh() {
                "refresh requested"
            } else {
                "polling is not running"
            };
            dashboard.set_status_note(note);
        }
        _ => {}
    }
    false
}
