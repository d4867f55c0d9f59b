mod ui;

use ehviewer_tui::backend::config::{Settings, app_cache_dir};
use ehviewer_tui::backend::engine::Engine;
use ehviewer_tui::backend::gallery::GalleryRef;
use image::DynamicImage;
use ui::ui::{App, View, ui};

use crossterm::{
    event::{Event, EventStream, KeyCode, KeyEventKind},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use futures::StreamExt;
use ratatui::{Terminal, backend::CrosstermBackend};
use std::{error::Error, fs, io};
use tokio::sync::{broadcast, mpsc};

enum BackgroundTask {
    PageDecoded { index: usize, image: DynamicImage },
    DecodeFailed { index: usize, error: String },
}

enum Command {
    Downloads,
    Read(GalleryRef),
    Download(GalleryRef, String),
}

const USAGE: &str = "usage: ehviewer-tui [read <gid> <token> | download <gid> <token> [title]]";

fn parse_gallery(gid: Option<&String>, token: Option<&String>) -> Result<GalleryRef, String> {
    let gid = gid
        .and_then(|g| g.parse::<u64>().ok())
        .ok_or_else(|| USAGE.to_string())?;
    let token = token.ok_or_else(|| USAGE.to_string())?;
    Ok(GalleryRef::new(gid, token.as_str()))
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    match args.first().map(String::as_str) {
        None => Ok(Command::Downloads),
        Some("read") => Ok(Command::Read(parse_gallery(args.get(1), args.get(2))?)),
        Some("download") => {
            let gallery = parse_gallery(args.get(1), args.get(2))?;
            let title = args.get(3..).map(|rest| rest.join(" ")).unwrap_or_default();
            Ok(Command::Download(gallery, title))
        }
        Some(_) => Err(USAGE.to_string()),
    }
}

/// Logs go to a file so they do not tear through the terminal UI.
fn init_logging() {
    let dir = app_cache_dir();
    if fs::create_dir_all(&dir).is_err() {
        return;
    }
    let Ok(file) = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("ehviewer-tui.log"))
    else {
        return;
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Pipe(Box::new(file)))
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(usage) => {
            eprintln!("{usage}");
            std::process::exit(2);
        }
    };

    init_logging();
    let settings = Settings::load();
    let engine = Engine::from_settings(settings)?;

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new();
    match command {
        Command::Downloads => {}
        Command::Read(gallery) => app.open_reader(engine.open_gallery(gallery)),
        Command::Download(gallery, title) => {
            let title = if title.is_empty() { gallery.gid.to_string() } else { title };
            engine.downloads().enqueue(gallery, &title, None);
        }
    }
    app.set_tasks(engine.downloads().tasks());

    let res = run_app(&mut terminal, &mut app, &engine).await;

    app.close_reader();
    if let Err(e) = engine.shutdown().await {
        log::warn!("could not save state on exit: {e}");
    }

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    if let Err(err) = res {
        eprintln!("{err}");
    }
    Ok(())
}

fn spawn_page_decoder(index: usize, payload: bytes::Bytes, tx: mpsc::UnboundedSender<BackgroundTask>) {
    tokio::spawn(async move {
        let decoded = tokio::task::spawn_blocking(move || image::load_from_memory(&payload)).await;
        let task = match decoded {
            Ok(Ok(image)) => BackgroundTask::PageDecoded { index, image },
            Ok(Err(e)) => BackgroundTask::DecodeFailed {
                index,
                error: e.to_string(),
            },
            Err(e) => BackgroundTask::DecodeFailed {
                index,
                error: e.to_string(),
            },
        };
        let _ = tx.send(task);
    });
}

fn set_cache_paused(engine: &Engine, paused: bool) {
    let cache = engine.cache().clone();
    tokio::spawn(async move {
        if let Err(e) = cache.set_paused(paused).await {
            log::warn!("could not {} disk cache: {e}", if paused { "pause" } else { "resume" });
        }
    });
}

async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
    engine: &Engine,
) -> io::Result<()> {
    let mut event_stream = EventStream::new();
    let mut download_rx = engine.downloads().subscribe();
    let (task_tx, mut task_rx) = mpsc::unbounded_channel::<BackgroundTask>();

    loop {
        app.cache_stats = engine.cache().stats();
        if app.cache_paused && app.scroll_idle() {
            set_cache_paused(engine, false);
            app.cache_paused = false;
        }
        if let Some((index, payload)) = app.page_to_decode() {
            if let Some(reader) = app.reader.as_mut() {
                reader.decoding = Some(index);
            }
            spawn_page_decoder(index, payload, task_tx.clone());
        }

        terminal.draw(|f| ui(f, app))?;

        tokio::select! {
            // Page states and cache stats are polled on every tick
            _ = tokio::time::sleep(tokio::time::Duration::from_millis(50)) => {}

            Some(Ok(event)) = event_stream.next() => {
                if let Event::Key(key) = event {
                    if key.kind == KeyEventKind::Press {
                        if key.code == KeyCode::Char('q') {
                            return Ok(());
                        }
                        match app.view {
                            View::Downloads => handle_downloads_input(app, key.code, engine).await,
                            View::Reader => handle_reader_input(app, key.code, engine),
                        }
                    }
                }
            }

            received = download_rx.recv() => {
                match received {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        app.set_tasks(engine.downloads().tasks());
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                }
            }

            Some(task) = task_rx.recv() => {
                match task {
                    BackgroundTask::PageDecoded { index, image } => {
                        app.set_page_image(index, image);
                    }
                    BackgroundTask::DecodeFailed { index, error } => {
                        log::warn!("page {index} could not be decoded: {error}");
                        app.set_decode_failed(index, error);
                    }
                }
            }
        }
    }
}

async fn handle_downloads_input(app: &mut App, key: KeyCode, engine: &Engine) {
    let downloads = engine.downloads();
    let selected = app.selected_task().map(|t| t.gid());

    match key {
        KeyCode::Up => app.select_prev(),
        KeyCode::Down => app.select_next(),
        KeyCode::Char('s') => {
            if let Some(gid) = selected {
                downloads.start(gid);
            }
        }
        KeyCode::Char('p') => {
            if let Some(gid) = selected {
                downloads.stop(gid);
            }
        }
        KeyCode::Char('a') => downloads.start_all(),
        KeyCode::Char('z') => downloads.stop_all(),
        KeyCode::Char(c @ ('x' | 'X')) => {
            if let Some(gid) = selected {
                if let Err(e) = downloads.delete(gid, c == 'X').await {
                    app.status = format!("delete failed: {e}");
                }
            }
        }
        KeyCode::Enter => {
            if let Some(task) = app.selected_task() {
                let gallery = task.gallery.clone();
                app.open_reader(engine.open_gallery(gallery));
            }
        }
        _ => {}
    }
}

fn handle_reader_input(app: &mut App, key: KeyCode, engine: &Engine) {
    match key {
        KeyCode::Esc => {
            app.close_reader();
            app.set_tasks(engine.downloads().tasks());
        }
        KeyCode::Left | KeyCode::Right => {
            let delta = if key == KeyCode::Left { -1 } else { 1 };
            if app.turn_page(delta) && !app.cache_paused {
                set_cache_paused(engine, true);
                app.cache_paused = true;
            }
        }
        KeyCode::Char('r') => {
            if let Some(reader) = app.reader.as_mut() {
                let index = reader.current();
                reader.image_index = None;
                reader.image_state = None;
                reader.decode_error = None;
                reader.session.invalidate(index);
            }
        }
        KeyCode::Char('d') => {
            if let Some(reader) = app.reader.as_ref() {
                let gallery = reader.session.gallery().clone();
                let title = reader
                    .session
                    .title()
                    .unwrap_or_else(|| gallery.gid.to_string());
                app.status = if engine.downloads().enqueue(gallery, &title, None) {
                    format!("queued {title}")
                } else {
                    format!("{title} is already in the download list")
                };
            }
        }
        _ => {}
    }
}
