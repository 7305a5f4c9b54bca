use bravia_quad::{
    FeatureState, Notification, NotificationReceiver, QuadClient, VolumeTransition, INPUT_BLUETOOTH,
    INPUT_HDMI, INPUT_SPOTIFY, INPUT_TV,
};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, Paragraph, Wrap},
    Frame, Terminal,
};
use std::collections::VecDeque;
use std::io;
use std::time::Duration;

const INPUTS: [&str; 4] = [INPUT_TV, INPUT_HDMI, INPUT_SPOTIFY, INPUT_BLUETOOTH];
const MAX_EVENTS: usize = 200;

struct App {
    client: QuadClient,
    volume: VolumeTransition,
    notifications: NotificationReceiver,
    state: FeatureState,
    events: VecDeque<Notification>,
    status_message: String,
}

impl App {
    async fn new(host: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let client = QuadClient::new(host, "Bravia Quad");
        client
            .set_volume_step_interval(Duration::from_millis(100))?;

        let notifications = client.subscribe();
        client.listen_for_notifications().await?;
        let state = client.fetch_all_states().await;
        let volume = VolumeTransition::new(client.clone());

        Ok(Self {
            client,
            volume,
            notifications,
            state,
            events: VecDeque::new(),
            status_message: format!("Connected to {}", host),
        })
    }

    fn report(&mut self, action: &str, result: bravia_quad::Result<bool>) {
        self.status_message = match result {
            Ok(true) => format!("{}: OK", action),
            Ok(false) => format!("{}: not acknowledged", action),
            Err(e) => format!("{} failed: {}", action, e),
        };
    }

    async fn adjust_volume(&mut self, delta: i16) {
        let current = self.volume.displayed_volume().unwrap_or(self.state.volume);
        let target = (i16::from(current) + delta).clamp(0, 100) as u8;
        let result = self.volume.set_volume(target).await;
        self.report(&format!("Volume {}", target), result);
    }

    async fn toggle_power(&mut self) {
        let on = self.state.power != bravia_quad::POWER_ON;
        let result = self.client.set_power(on).await;
        self.report(if on { "Power on" } else { "Power off" }, result);
    }

    async fn cycle_input(&mut self) {
        let index = INPUTS
            .iter()
            .position(|input| *input == self.state.input)
            .map_or(0, |i| (i + 1) % INPUTS.len());
        let result = self.client.set_input(INPUTS[index]).await;
        self.report(&format!("Input {}", INPUTS[index]), result);
    }

    async fn toggle_night_mode(&mut self) {
        let enabled = !self.state.is_on(bravia_quad::NIGHT_MODE);
        let result = self.client.set_night_mode(enabled).await;
        self.report("Night mode", result);
    }

    async fn toggle_voice_enhancer(&mut self) {
        let enabled = !self.state.is_on(bravia_quad::VOICE_ENHANCER);
        let result = self.client.set_voice_enhancer(enabled).await;
        self.report("Voice enhancer", result);
    }

    async fn toggle_sound_field(&mut self) {
        let enabled = !self.state.is_on(bravia_quad::SOUND_FIELD);
        let result = self.client.set_sound_field(enabled).await;
        self.report("Sound field", result);
    }

    async fn detect_subwoofer(&mut self) {
        self.status_message = match self.client.detect_subwoofer().await {
            Ok(true) => "Subwoofer detected".to_string(),
            Ok(false) => "No subwoofer".to_string(),
            Err(e) => format!("Subwoofer detection failed: {}", e),
        };
    }

    async fn start_pairing(&mut self) {
        self.status_message = match self.client.start_bluetooth_pairing().await {
            Ok(()) => "Bluetooth pairing started".to_string(),
            Err(e) => format!("Bluetooth pairing failed: {}", e),
        };
    }

    fn handle_notifications(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        while let Some(notification) = self.notifications.try_recv()? {
            self.events.push_front(notification);
            self.events.truncate(MAX_EVENTS);
        }
        self.state = self.client.state();
        Ok(())
    }
}

fn ui(f: &mut Frame, app: &App) {
    let outer_chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([Constraint::Min(0), Constraint::Length(3)])
        .split(f.size());

    let inner_chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(outer_chunks[0]);

    render_state(f, app, inner_chunks[0]);
    render_events(f, app, inner_chunks[1]);
    render_status(f, app, outer_chunks[1]);
}

fn on_off(on: bool) -> Span<'static> {
    if on {
        Span::styled("ON", Style::default().fg(Color::Green).add_modifier(Modifier::BOLD))
    } else {
        Span::styled("OFF", Style::default().fg(Color::Gray))
    }
}

fn label(text: &str) -> Span<'_> {
    Span::styled(text, Style::default().fg(Color::Yellow))
}

fn value(text: String) -> Span<'static> {
    Span::styled(text, Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
}

fn render_state(f: &mut Frame, app: &App, area: Rect) {
    let block = Block::default()
        .title(" Bravia Quad (+/- vol, p power, i input, n night, v voice, s field, d sub, b pair, q quit) ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Green));

    let state = &app.state;
    let volume = match app.volume.displayed_volume() {
        Some(shown) if app.volume.is_transitioning() => format!("{} (stepping)", shown),
        Some(shown) => shown.to_string(),
        None => state.volume.to_string(),
    };
    let subwoofer = match state.has_subwoofer {
        Some(true) => "yes",
        Some(false) => "no",
        None => "unknown",
    };

    let lines = vec![
        Line::from(vec![
            Span::styled(
                "Device: ",
                Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
            ),
            Span::raw(app.client.host().to_string()),
        ]),
        Line::from(""),
        Line::from(vec![label("Power: "), on_off(state.is_on(bravia_quad::POWER))]),
        Line::from(vec![label("Volume: "), value(volume)]),
        Line::from(vec![label("Input: "), value(state.input.clone())]),
        Line::from(vec![label("Rear Level: "), value(state.rear_level.to_string())]),
        Line::from(vec![label("Bass Level: "), value(state.bass_level.to_string())]),
        Line::from(vec![label("Subwoofer: "), value(subwoofer.to_string())]),
        Line::from(""),
        Line::from(vec![label("Voice Enhancer: "), on_off(state.is_on(bravia_quad::VOICE_ENHANCER))]),
        Line::from(vec![label("Sound Field: "), on_off(state.is_on(bravia_quad::SOUND_FIELD))]),
        Line::from(vec![label("Night Mode: "), on_off(state.is_on(bravia_quad::NIGHT_MODE))]),
        Line::from(vec![label("DRC: "), value(state.drc.clone())]),
        Line::from(vec![label("Auto Volume: "), on_off(state.is_on(bravia_quad::ADVANCED_AUTO_VOLUME))]),
        Line::from(vec![label("HDMI CEC: "), on_off(state.is_on(bravia_quad::HDMI_CEC))]),
        Line::from(vec![label("Auto Standby: "), on_off(state.is_on(bravia_quad::AUTO_STANDBY))]),
    ];

    let text = Paragraph::new(lines).block(block).wrap(Wrap { trim: true });
    f.render_widget(text, area);
}

fn render_events(f: &mut Frame, app: &App, area: Rect) {
    let block = Block::default()
        .title(" Notifications ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Blue));

    let items: Vec<ListItem> = app
        .events
        .iter()
        .map(|n| {
            ListItem::new(Line::from(vec![
                Span::styled(format!("{} ", n.feature), Style::default().fg(Color::Yellow)),
                Span::raw(n.value.to_string()),
            ]))
        })
        .collect();

    f.render_widget(List::new(items).block(block), area);
}

fn render_status(f: &mut Frame, app: &App, area: Rect) {
    let block = Block::default()
        .title(" Status ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Gray));

    let text = Paragraph::new(app.status_message.clone())
        .block(block)
        .wrap(Wrap { trim: true });

    f.render_widget(text, area);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let Some(host) = std::env::args().nth(1) else {
        eprintln!("usage: control <host>");
        return Ok(());
    };

    // Connect before taking over the terminal so errors stay readable
    let mut app = App::new(&host).await?;

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let res = run_app(&mut terminal, &mut app).await;

    app.client.disconnect().await;

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    if let Err(err) = res {
        println!("Error: {}", err);
    }

    Ok(())
}

async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        app.handle_notifications()?;

        terminal.draw(|f| ui(f, app))?;

        if event::poll(Duration::from_millis(100))? {
            if let Event::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                match key.code {
                    KeyCode::Char('q') | KeyCode::Esc => return Ok(()),
                    KeyCode::Char('+') | KeyCode::Char('=') => app.adjust_volume(1).await,
                    KeyCode::Char('-') | KeyCode::Char('_') => app.adjust_volume(-1).await,
                    KeyCode::PageUp => app.adjust_volume(5).await,
                    KeyCode::PageDown => app.adjust_volume(-5).await,
                    KeyCode::Char('p') => app.toggle_power().await,
                    KeyCode::Char('i') => app.cycle_input().await,
                    KeyCode::Char('n') => app.toggle_night_mode().await,
                    KeyCode::Char('v') => app.toggle_voice_enhancer().await,
                    KeyCode::Char('s') => app.toggle_sound_field().await,
                    KeyCode::Char('d') => app.detect_subwoofer().await,
                    KeyCode::Char('b') => app.start_pairing().await,
                    _ => {}
                }
            }
        }
    }
}
