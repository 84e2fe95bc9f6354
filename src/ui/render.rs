use ratatui::buffer::Buffer;
use ratatui::layout::{Constraint, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::Line;
use ratatui::widgets::{Block, Clear, Paragraph, Widget};
use ratatui::Frame;

use crate::device::DeviceDescriptor;
use crate::heatmap::Heatmap;

/// Rows used by the header and legend around the grid.
pub const CHROME_ROWS: u16 = 2;

const TOO_SMALL: &str = " WINDOW TOO SMALL ";

const HELP_LINES: [&str; 5] = [
    " Blockmon Block Activity Monitor Quick Help ",
    "",
    " ? or h     This help information",
    " c          Clear pop-ups",
    " Esc or q   Quit",
];
const HELP_WIDTH: u16 = 46;

/// Background colours of active tiers, coolest first.
const ACTIVE_COLOURS: [Color; 7] = [
    Color::Cyan,
    Color::Green,
    Color::Yellow,
    Color::Red,
    Color::Magenta,
    Color::LightRed,
    Color::White,
];

fn header_style() -> Style {
    Style::new()
        .fg(Color::White)
        .bg(Color::Blue)
        .add_modifier(Modifier::BOLD)
}

fn popup_style() -> Style {
    Style::new()
        .fg(Color::White)
        .bg(Color::Red)
        .add_modifier(Modifier::BOLD)
}

/// Status shown on the top line.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub device: DeviceDescriptor,
    pub live_records: usize,
    pub active_percent: f64,
}

impl Header {
    pub fn line(&self) -> String {
        format!(
            "Blockmon: Dev: {} {} blocks @ {} bytes per block  live: {}  active: {:.1}%",
            self.device.id,
            self.device.total_blocks,
            self.device.block_size,
            self.live_records,
            self.active_percent,
        )
    }
}

/// Character and style for a cell of the given tier.
pub fn cell_style(tier: u8) -> (char, Style) {
    if tier == 0 {
        return (
            '.',
            Style::new()
                .fg(Color::White)
                .bg(Color::Blue)
                .add_modifier(Modifier::DIM),
        );
    }
    let idx = usize::from(tier - 1).min(ACTIVE_COLOURS.len() - 1);
    (
        'W',
        Style::new()
            .fg(Color::White)
            .bg(ACTIVE_COLOURS[idx])
            .add_modifier(Modifier::BOLD),
    )
}

/// Draws a projected heatmap one character per cell.
pub struct HeatmapWidget<'a> {
    map: &'a Heatmap,
}

impl<'a> HeatmapWidget<'a> {
    pub fn new(map: &'a Heatmap) -> Self {
        Self { map }
    }
}

impl Widget for HeatmapWidget<'_> {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let size = self.map.size();
        let width = area.width.min(size.width);
        let height = area.height.min(size.height);

        for y in 0..height {
            for x in 0..width {
                let (ch, style) = cell_style(self.map.tier_at(x, y));
                if let Some(cell) = buf.cell_mut((area.x + x, area.y + y)) {
                    cell.set_char(ch).set_style(style);
                }
            }
        }
    }
}

/// Split the screen into header, grid and legend rows.
pub fn layout(area: Rect) -> [Rect; 3] {
    Layout::vertical([
        Constraint::Length(1),
        Constraint::Min(0),
        Constraint::Length(1),
    ])
    .areas(area)
}

/// Draw a full frame.
pub fn draw_frame(frame: &mut Frame, header: &Header, map: &Heatmap, show_help: bool) {
    let [top, grid, bottom] = layout(frame.area());

    frame.render_widget(Paragraph::new(header.line()).style(header_style()), top);
    frame.render_widget(HeatmapWidget::new(map), grid);
    frame.render_widget(Paragraph::new(map.legend()).style(header_style()), bottom);

    if show_help {
        draw_help(frame);
    }
}

fn draw_help(frame: &mut Frame) {
    let area = frame.area();
    let popup = centered(area, HELP_WIDTH, HELP_LINES.len() as u16);

    let lines: Vec<Line> = HELP_LINES.iter().map(|l| Line::raw(*l)).collect();
    frame.render_widget(Clear, popup);
    frame.render_widget(Paragraph::new(lines).style(popup_style()), popup);
}

/// Placeholder shown while the window is below the minimum usable size.
pub fn draw_too_small(frame: &mut Frame) {
    let area = frame.area();
    frame.render_widget(Block::new().style(Style::new().bg(Color::Blue)), area);

    let msg = centered(area, TOO_SMALL.len() as u16, 1);
    frame.render_widget(Paragraph::new(TOO_SMALL).style(popup_style()), msg);
}

fn centered(area: Rect, width: u16, height: u16) -> Rect {
    let width = width.min(area.width);
    let height = height.min(area.height);
    Rect::new(
        area.x + (area.width - width) / 2,
        area.y + (area.height - height) / 2,
        width,
        height,
    )
}
