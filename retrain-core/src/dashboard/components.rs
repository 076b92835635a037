use crate::{layout::Split, runs::Metric};
use ratatui::{
    buffer::Buffer,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    symbols::Marker,
    text::Text,
    widgets::{Axis, Block, Borders, Chart, Dataset, GraphType, Padding, Paragraph, Widget, Wrap},
};

const COLORS: [Color; 6] = [
    Color::Cyan,
    Color::Yellow,
    Color::Magenta,
    Color::Green,
    Color::Blue,
    Color::Red,
];

pub(crate) struct Title {
    pub title: String,
}

impl Widget for Title {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let block = Block::default().borders(Borders::ALL);
        Paragraph::new(Text::styled(&self.title, Style::default().fg(Color::Green)))
            .block(block)
            .wrap(Wrap { trim: true })
            .render(area, buf);
    }
}

pub(crate) struct Quit;

impl Widget for Quit {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let block = Block::default()
            .title("Y/N")
            .padding(Padding::horizontal(3))
            .borders(Borders::NONE)
            .style(Style::default().bg(Color::DarkGray));
        Paragraph::new(Text::styled("Quit? (y/n)", Style::default().fg(Color::Red)))
            .block(block)
            .wrap(Wrap { trim: false })
            .render(area, buf);
    }
}

/// One line per run and split.
pub(crate) struct Series {
    pub run: String,
    /// Position of the run, picks its color.
    pub index: usize,
    pub split: Split,
    pub points: Vec<(f64, f64)>,
}

pub(crate) struct MetricChart<'a> {
    pub metric: Metric,
    pub series: &'a [Series],
}

impl Widget for MetricChart<'_> {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let points = self.series.iter().flat_map(|s| s.points.iter());
        let (mut x_max, mut y_min, mut y_max) = (1f64, f64::MAX, f64::MIN);
        for (x, y) in points {
            x_max = x_max.max(*x);
            y_min = y_min.min(*y);
            y_max = y_max.max(*y);
        }
        let (y_min, y_max) = match self.metric {
            Metric::Accuracy => (0., 1.),
            Metric::Loss if y_min > y_max => (0., 1.),
            Metric::Loss => (0f64.min(y_min), y_max.max(y_min + f64::EPSILON)),
        };

        let datasets = self
            .series
            .iter()
            .map(|s| {
                let color = COLORS[s.index % COLORS.len()];
                let (style, marker) = match s.split {
                    Split::Train => (Style::default().fg(color), Marker::Braille),
                    Split::Val => (
                        Style::default().fg(color).add_modifier(Modifier::DIM),
                        Marker::Braille,
                    ),
                    Split::Test => (
                        Style::default().fg(color).add_modifier(Modifier::BOLD),
                        Marker::Dot,
                    ),
                };
                Dataset::default()
                    .name(format!("{} {}", s.run, s.split))
                    .marker(marker)
                    .graph_type(GraphType::Line)
                    .style(style)
                    .data(&s.points)
            })
            .collect::<Vec<_>>();

        Chart::new(datasets)
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(format!(" {} ", self.metric.name())),
            )
            .x_axis(
                Axis::default()
                    .title("epoch")
                    .bounds([0., x_max])
                    .labels(["0".to_string(), format!("{x_max}")]),
            )
            .y_axis(
                Axis::default()
                    .title(self.metric.name())
                    .bounds([y_min, y_max])
                    .labels([format!("{y_min:.2}"), format!("{y_max:.2}")]),
            )
            .render(area, buf);
    }
}

pub(crate) fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);
    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}
