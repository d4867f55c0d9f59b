use image::DynamicImage;
use ratatui::{
    Frame,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, List, ListItem, ListState, Paragraph},
};
use ratatui_image::{Resize, StatefulImage, picker::Picker, protocol::StatefulProtocol};
use std::time::{Duration, Instant};

use ehviewer_tui::backend::cache::CacheStats;
use ehviewer_tui::backend::download::{DownloadTask, TaskState};
use ehviewer_tui::backend::pages::PageState;
use ehviewer_tui::backend::session::GallerySession;

/// Two page turns closer together than this count as fast scrolling.
const FAST_TURN: Duration = Duration::from_millis(150);
/// Quiet period after which the disk cache is resumed.
const SCROLL_IDLE: Duration = Duration::from_millis(600);

#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub enum View {
    #[default]
    Downloads,
    Reader,
}

pub struct Reader {
    pub session: GallerySession,
    pub image_index: Option<usize>,
    pub image_state: Option<StatefulProtocol>,
    pub decoding: Option<usize>,
    /// Why the page at `image_index` could not be decoded.
    pub decode_error: Option<String>,
    last_turn: Option<Instant>,
}

impl Reader {
    fn new(session: GallerySession) -> Self {
        Reader {
            session,
            image_index: None,
            image_state: None,
            decoding: None,
            decode_error: None,
            last_turn: None,
        }
    }

    pub fn current(&self) -> usize {
        self.session.current_index()
    }
}

pub struct App {
    pub view: View,
    pub picker: Option<Picker>,
    pub tasks: Vec<DownloadTask>,
    pub task_list_state: ListState,
    pub reader: Option<Reader>,
    pub cache_stats: CacheStats,
    pub status: String,
    pub cache_paused: bool,
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

impl App {
    pub fn new() -> Self {
        let picker = Picker::from_query_stdio().ok();

        Self {
            view: View::Downloads,
            picker,
            tasks: Vec::new(),
            task_list_state: ListState::default(),
            reader: None,
            cache_stats: CacheStats::default(),
            status: String::new(),
            cache_paused: false,
        }
    }

    pub fn set_tasks(&mut self, tasks: Vec<DownloadTask>) {
        self.tasks = tasks;
        let selected = match (self.task_list_state.selected(), self.tasks.len()) {
            (_, 0) => None,
            (Some(i), len) => Some(i.min(len - 1)),
            (None, _) => Some(0),
        };
        self.task_list_state.select(selected);
    }

    pub fn selected_task(&self) -> Option<&DownloadTask> {
        self.task_list_state.selected().and_then(|i| self.tasks.get(i))
    }

    pub fn select_next(&mut self) {
        if let Some(i) = self.task_list_state.selected() {
            if i + 1 < self.tasks.len() {
                self.task_list_state.select(Some(i + 1));
            }
        }
    }

    pub fn select_prev(&mut self) {
        if let Some(i) = self.task_list_state.selected() {
            self.task_list_state.select(Some(i.saturating_sub(1)));
        }
    }

    pub fn open_reader(&mut self, session: GallerySession) {
        session.set_current_index(0);
        self.reader = Some(Reader::new(session));
        self.view = View::Reader;
    }

    pub fn close_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.session.close();
        }
        self.view = View::Downloads;
    }

    /// Moves the reader by `delta` pages. Returns `true` when the page
    /// turn came fast enough to count as scrolling.
    pub fn turn_page(&mut self, delta: isize) -> bool {
        let Some(reader) = self.reader.as_mut() else {
            return false;
        };
        let target = reader.current().saturating_add_signed(delta);
        let now = Instant::now();
        let fast = reader
            .last_turn
            .is_some_and(|last| now.duration_since(last) < FAST_TURN);
        reader.last_turn = Some(now);

        let index = reader.session.set_current_index(target);
        if reader.image_index != Some(index) {
            reader.image_state = None;
            reader.image_index = None;
            reader.decode_error = None;
        }
        fast
    }

    /// Whether scrolling has been quiet long enough to resume the disk cache.
    pub fn scroll_idle(&self) -> bool {
        self.reader
            .as_ref()
            .and_then(|r| r.last_turn)
            .is_none_or(|last| last.elapsed() >= SCROLL_IDLE)
    }

    /// Index whose ready payload still needs decoding, if any.
    pub fn page_to_decode(&self) -> Option<(usize, bytes::Bytes)> {
        self.picker.as_ref()?;
        let reader = self.reader.as_ref()?;
        let index = reader.current();
        if reader.image_index == Some(index) || reader.decoding == Some(index) {
            return None;
        }
        let page = reader.session.page(index);
        match (page.state, page.payload) {
            (PageState::Ready, Some(payload)) => Some((index, payload)),
            _ => None,
        }
    }

    pub fn set_page_image(&mut self, index: usize, image: DynamicImage) {
        let Some(reader) = self.reader.as_mut() else {
            return;
        };
        if reader.decoding == Some(index) {
            reader.decoding = None;
        }
        if reader.current() != index {
            return;
        }
        if let Some(ref picker) = self.picker {
            reader.image_state = Some(picker.new_resize_protocol(image));
        }
        reader.image_index = Some(index);
        reader.decode_error = None;
    }

    /// Records that the payload of `index` is not a readable image so it is
    /// not decoded again until the page is retried.
    pub fn set_decode_failed(&mut self, index: usize, error: String) {
        let Some(reader) = self.reader.as_mut() else {
            return;
        };
        if reader.decoding == Some(index) {
            reader.decoding = None;
        }
        if reader.current() != index {
            return;
        }
        reader.image_state = None;
        reader.image_index = Some(index);
        reader.decode_error = Some(error);
    }
}

pub fn ui(f: &mut Frame, app: &mut App) {
    let root = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // header
            Constraint::Min(5),    // content
            Constraint::Length(3), // footer
        ])
        .split(f.area());

    match app.view {
        View::Downloads => {
            draw_header(f, root[0], "Downloads", &downloads_summary(app));
            draw_downloads(f, root[1], app);
            draw_footer(
                f,
                root[2],
                &[
                    ("↑/↓", "select"),
                    ("s/p", "start/stop"),
                    ("a/z", "all"),
                    ("x/X", "delete/+files"),
                    ("q", "quit"),
                ],
            );
        }
        View::Reader => {
            let (title, position) = reader_titles(app);
            draw_header(f, root[0], &title, &position);
            draw_reader(f, root[1], app);
            draw_footer(
                f,
                root[2],
                &[
                    ("←/→", "page"),
                    ("r", "retry"),
                    ("d", "download"),
                    ("Esc", "downloads"),
                    ("q", "quit"),
                ],
            );
        }
    }
}

fn downloads_summary(app: &App) -> String {
    let stats = &app.cache_stats;
    let mut summary = format!(
        "cache {} mem / {} disk, {} hits, {} misses",
        format_bytes(stats.memory_bytes as u64),
        format_bytes(stats.disk_bytes),
        stats.memory_hits + stats.disk_hits,
        stats.misses
    );
    if !app.status.is_empty() {
        summary = format!("{}  |  {}", app.status, summary);
    }
    summary
}

fn reader_titles(app: &App) -> (String, String) {
    let Some(reader) = app.reader.as_ref() else {
        return (String::from("Reader"), String::new());
    };
    let session = &reader.session;
    let title = session
        .title()
        .unwrap_or_else(|| session.gallery().to_string());
    let total = session
        .total_pages()
        .map_or_else(|| String::from("?"), |t| t.to_string());
    let mut position = format!("page {} / {}", reader.current() + 1, total);
    if app.cache_paused {
        position.push_str("  (cache paused)");
    }
    if !app.status.is_empty() {
        position = format!("{position}  |  {}", app.status);
    }
    (title, position)
}

fn draw_header(f: &mut Frame, area: Rect, title: &str, detail: &str) {
    let text = Line::from(vec![Span::styled(
        truncate_text(detail, area.width.saturating_sub(4) as usize),
        Style::default().fg(Color::DarkGray),
    )]);
    let header = Paragraph::new(text).block(
        Block::default()
            .borders(Borders::ALL)
            .title(truncate_text(title, area.width.saturating_sub(4) as usize))
            .border_style(Style::default().fg(Color::Cyan)),
    );
    f.render_widget(header, area);
}

fn state_label(task: &DownloadTask) -> (&'static str, Color) {
    match task.state {
        TaskState::None if task.last_error.is_some() => ("failed", Color::Red),
        TaskState::None => ("stopped", Color::DarkGray),
        TaskState::Waiting => ("waiting", Color::Yellow),
        TaskState::Downloading => ("downloading", Color::Cyan),
        TaskState::Finished => ("finished", Color::Green),
    }
}

fn draw_downloads(f: &mut Frame, area: Rect, app: &mut App) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::White));

    if app.tasks.is_empty() {
        let empty = Paragraph::new("No downloads. Start one with: ehviewer-tui download <gid> <token>")
            .alignment(Alignment::Center)
            .style(Style::default().fg(Color::DarkGray))
            .block(block);
        f.render_widget(empty, area);
        return;
    }

    let title_width = area.width.saturating_sub(40) as usize;
    let items: Vec<ListItem> = app
        .tasks
        .iter()
        .map(|task| {
            let (label, color) = state_label(task);
            let total = task
                .total_pages
                .map_or_else(|| String::from("?"), |t| t.to_string());
            let mut spans = vec![
                Span::styled(format!("{label:<12}"), Style::default().fg(color)),
                Span::styled(
                    format!("{:<width$} ", truncate_text(&task.title, title_width), width = title_width),
                    Style::default().fg(Color::White).add_modifier(Modifier::BOLD),
                ),
                Span::raw(format!("{:>5}/{:<5}", task.completed_pages, total)),
            ];
            if task.state == TaskState::Downloading {
                spans.push(Span::styled(
                    format!(" {}/s", format_bytes(task.bytes_per_second)),
                    Style::default().fg(Color::Cyan),
                ));
            }
            ListItem::new(Line::from(spans))
        })
        .collect();

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(3), Constraint::Length(3)])
        .split(area);

    let list = List::new(items)
        .block(block)
        .highlight_style(Style::default().bg(Color::DarkGray).add_modifier(Modifier::BOLD))
        .highlight_symbol("▶ ");
    f.render_stateful_widget(list, chunks[0], &mut app.task_list_state);

    if let Some(task) = app.selected_task() {
        draw_task_detail(f, chunks[1], task);
    }
}

fn draw_task_detail(f: &mut Frame, area: Rect, task: &DownloadTask) {
    let block = Block::default()
        .borders(Borders::ALL)
        .title(format!("{}", task.gallery))
        .border_style(Style::default().fg(Color::DarkGray));

    if let Some(error) = &task.last_error {
        let text = Paragraph::new(truncate_text(error, area.width.saturating_sub(4) as usize))
            .style(Style::default().fg(Color::Red))
            .block(block);
        f.render_widget(text, area);
        return;
    }

    let ratio = task.progress().unwrap_or(0.0).clamp(0.0, 1.0);
    let label = match task.legacy_page_count {
        0 => format!("{:.0}%", ratio * 100.0),
        legacy => format!("{:.0}% ({legacy} reused)", ratio * 100.0),
    };
    let gauge = Gauge::default()
        .block(block)
        .gauge_style(Style::default().fg(Color::Cyan))
        .ratio(ratio)
        .label(label);
    f.render_widget(gauge, area);
}

fn draw_reader(f: &mut Frame, area: Rect, app: &mut App) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::White));
    let inner = block.inner(area);
    f.render_widget(block, area);

    let Some(reader) = app.reader.as_mut() else {
        return;
    };
    let index = reader.current();

    if reader.image_index == Some(index) {
        if let Some(state) = reader.image_state.as_mut() {
            let image_widget = StatefulImage::new().resize(Resize::Scale(None));
            f.render_stateful_widget(image_widget, inner, state);
            return;
        }
    }

    let page = reader.session.page(index);
    let decode_error = reader
        .decode_error
        .as_deref()
        .filter(|_| reader.image_index == Some(index));
    let (message, color) = page_message(
        &page.state,
        app.picker.is_some(),
        decode_error,
        reader.session.probe_error(),
    );

    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage(45),
            Constraint::Length(2),
            Constraint::Percentage(45),
        ])
        .split(inner);
    let paragraph = Paragraph::new(truncate_text(&message, inner.width as usize))
        .style(Style::default().fg(color).add_modifier(Modifier::BOLD))
        .alignment(Alignment::Center);
    f.render_widget(paragraph, vertical[1]);
}

/// Status line shown in place of a page that has no image to draw yet.
fn page_message(
    state: &PageState,
    can_show_images: bool,
    decode_error: Option<&str>,
    probe_error: Option<String>,
) -> (String, Color) {
    match state {
        PageState::Unresolved => match probe_error {
            Some(error) => (format!("Gallery unavailable: {error}"), Color::Red),
            None => (String::from("Waiting..."), Color::DarkGray),
        },
        PageState::Resolving { retry: 0 } => (String::from("Locating image..."), Color::Yellow),
        PageState::Resolving { retry } => (format!("Locating image... (retry {retry})"), Color::Yellow),
        PageState::Fetching { .. } => (String::from("Downloading image..."), Color::Cyan),
        PageState::Ready if !can_show_images => (
            String::from("Ready (this terminal cannot show images)"),
            Color::Green,
        ),
        PageState::Ready => match decode_error {
            Some(error) => (format!("Cannot display page: {error}  (press r to retry)"), Color::Red),
            None => (String::from("Decoding..."), Color::Green),
        },
        PageState::Failed { reason } => (format!("Failed: {reason}  (press r to retry)"), Color::Red),
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        text.to_string()
    } else {
        format!(
            "{}...",
            text.chars()
                .take(max_len.saturating_sub(3))
                .collect::<String>()
        )
    }
}

fn draw_footer(f: &mut Frame, area: Rect, keys: &[(&str, &str)]) {
    let mut spans = Vec::new();
    for (key, action) in keys {
        spans.push(Span::styled(*key, Style::default().fg(Color::Yellow)));
        spans.push(Span::raw(format!(": {action}  ")));
    }

    let p = Paragraph::new(Line::from(spans))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::Cyan)),
        )
        .alignment(Alignment::Center);
    f.render_widget(p, area);
}
