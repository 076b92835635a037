mod components;
mod terminal;

use crate::{
    layout::Split,
    runs::{Metric, Run},
};
use anyhow::Result;
use components::{centered_rect, MetricChart, Quit, Series, Title};
use crossterm::event::{self, Event as TermEvent, KeyCode, KeyEventKind};
use ratatui::{
    layout::{Constraint, Layout, Rect},
    Frame,
};
use std::{io::Write, time::Duration};
use terminal::AutoDropTerminal;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum CurrentScreen {
    #[default]
    Main,
    Exiting,
}

/// Interactive comparison of the loss and accuracy curves of logged runs.
pub struct Dashboard {
    runs: Vec<Run>,
    metric: Metric,
    current_screen: CurrentScreen,
}

impl Dashboard {
    pub fn new(runs: Vec<Run>) -> Self {
        Self {
            runs,
            metric: Metric::Accuracy,
            current_screen: CurrentScreen::Main,
        }
    }

    pub fn run(&mut self) -> Result<()> {
        let mut terminal = AutoDropTerminal::new()?;
        loop {
            terminal.draw(|f| {
                let area = f.area();
                self.render(f, area);
            })?;
            while let TermEvent::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Release {
                    continue;
                }
                if event::poll(Duration::from_millis(50))? {
                    continue;
                }
                if self.handle_key(key.code) {
                    return Ok(());
                }
                break;
            }
        }
    }

    /// Returns whether the dashboard should close.
    fn handle_key(&mut self, code: KeyCode) -> bool {
        match self.current_screen {
            CurrentScreen::Main => match code {
                KeyCode::Char('q') => self.current_screen = CurrentScreen::Exiting,
                KeyCode::Char('l') => self.metric = Metric::Loss,
                KeyCode::Char('a') => self.metric = Metric::Accuracy,
                _ => {}
            },
            CurrentScreen::Exiting => match code {
                KeyCode::Char('y') => return true,
                _ => self.current_screen = CurrentScreen::Main,
            },
        }
        false
    }

    fn series(&self) -> Vec<Series> {
        self.runs
            .iter()
            .enumerate()
            .flat_map(|(index, run)| {
                [Split::Train, Split::Val, Split::Test].map(|split| Series {
                    run: run.name.clone(),
                    index,
                    split,
                    points: run.series(split, self.metric),
                })
            })
            .filter(|s| !s.points.is_empty())
            .collect()
    }

    fn render(&self, f: &mut Frame<'_>, area: Rect) {
        if self.current_screen == CurrentScreen::Exiting {
            f.render_widget(Quit, centered_rect(60, 25, area));
            return;
        }
        let [title, chart] =
            Layout::vertical([Constraint::Length(3), Constraint::Fill(1)]).areas(area);
        f.render_widget(
            Title {
                title: format!("{} runs | [a]ccuracy [l]oss [q]uit", self.runs.len()),
            },
            title,
        );
        let series = self.series();
        f.render_widget(
            MetricChart {
                metric: self.metric,
                series: &series,
            },
            chart,
        );
    }
}

/// Plain comparison table, one row per run.
pub fn render_table(runs: &[Run], out: &mut impl Write) -> Result<()> {
    let width = runs
        .iter()
        .map(|r| r.name.len())
        .max()
        .unwrap_or(0)
        .max("run".len());
    let pct = |v: Option<f64>| v.map_or("-".to_string(), |v| format!("{:.1}%", v * 100.));
    writeln!(
        out,
        "{:<width$}  {:>6}  {:>8}  {:>10}  {:>9}  {:>9}",
        "run", "epochs", "best val", "train loss", "test init", "test last"
    )?;
    for run in runs {
        let tests = run.series(Split::Test, Metric::Accuracy);
        let initial = tests.first().filter(|(e, _)| *e == 0.).map(|(_, v)| *v);
        let last = tests.last().filter(|(e, _)| *e > 0.).map(|(_, v)| *v);
        writeln!(
            out,
            "{:<width$}  {:>6}  {:>8}  {:>10}  {:>9}  {:>9}",
            run.name,
            run.epochs(),
            pct(run.best(Split::Val, Metric::Accuracy)),
            run.last(Split::Train, Metric::Loss)
                .map_or("-".to_string(), |v| format!("{v:.4}")),
            pct(initial),
            pct(last),
        )?;
    }
    Ok(())
}
