use std::fs;
use std::io;
use std::ops::Range;
use std::panic;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::{Datelike, Duration, NaiveDate};
use clap::{ArgAction, Parser, ValueHint};
use plotters::coord::ranged1d::{KeyPointHint, NoDefaultFormatting, Ranged, ValueFormatter};
use plotters::prelude::*;
use plotters::style::text_anchor::{HPos, Pos, VPos};
use plotters::style::{FontDesc, FontFamily, FontStyle};
use sleep_chart::rolling::{monday_segments, rolling_window, series_mean, WeekSegment};
use sleep_chart::{filter_records, parse_records, FilterParams, SleepKind, SleepRecord};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

// 10.8 x 7.2 inch figure at 100 dpi.
const FIGURE_SIZE: (u32, u32) = (1080, 720);
const DATA_ALPHA: f64 = 0.1;
const GRID_ALPHA: f64 = 0.33;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Render a sleep-duration trend chart from a sleep tracker CSV export",
    long_about = None
)]
struct Cli {
    /// Sleep tracker CSV export to read
    #[arg(value_name = "sleep-data-file-path", value_hint = ValueHint::FilePath)]
    sleep_data_file: PathBuf,

    /// Output image path (format chosen by extension)
    #[arg(value_name = "output-file-path", value_hint = ValueHint::FilePath)]
    output_file: PathBuf,

    /// Keep only rows strictly after this date (YYYY-MM-DD)
    #[arg(long, value_parser = parse_cli_date)]
    after: Option<NaiveDate>,

    /// Keep only rows strictly before this date (YYYY-MM-DD)
    #[arg(long, value_parser = parse_cli_date)]
    before: Option<NaiveDate>,

    /// Drop Saturday and Sunday rows
    #[arg(long, action = ArgAction::SetTrue)]
    exclude_weekends: bool,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

fn parse_cli_date(value: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| format!("expected a YYYY-MM-DD date, got `{value}`"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    let t_load = Instant::now();
    let data = fs::read(&cli.sleep_data_file)
        .with_context(|| format!("failed to read {}", cli.sleep_data_file.display()))?;
    let records = parse_records(&data)
        .with_context(|| format!("failed to parse {}", cli.sleep_data_file.display()))?;
    debug!(
        "Load stage: {:.1} ms",
        t_load.elapsed().as_secs_f64() * 1000.0
    );
    info!("Loaded {} rows", records.len());

    let params = FilterParams {
        after: cli.after,
        before: cli.before,
        exclude_weekends: cli.exclude_weekends,
    };
    let records = filter_records(&records, &params);
    info!("Retained {} rows after filtering", records.len());

    let t_plot = Instant::now();
    let kind = chart_kind_for(&cli.output_file);
    render_chart_guard(&records, params.exclude_weekends, &cli.output_file, kind)
        .map_err(|err| anyhow!("failed to render {}: {}", cli.output_file.display(), err))?;
    debug!(
        "Plot stage: {:.1} ms",
        t_plot.elapsed().as_secs_f64() * 1000.0
    );
    info!("Wrote chart: {}", cli.output_file.display());

    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChartKind {
    Bitmap,
    Svg,
}

/// The bitmap backend handles its own raster format dispatch by extension,
/// so only SVG needs a dedicated backend.
fn chart_kind_for(path: &Path) -> ChartKind {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("svg") => ChartKind::Svg,
        _ => ChartKind::Bitmap,
    }
}

fn render_chart_guard(
    records: &[SleepRecord],
    exclude_weekends: bool,
    path: &Path,
    kind: ChartKind,
) -> Result<(), String> {
    let render = || -> Result<(), String> {
        match kind {
            ChartKind::Bitmap => {
                let root = BitMapBackend::new(path, FIGURE_SIZE).into_drawing_area();
                draw_chart(root, records, exclude_weekends)
                    .map_err(|e| format!("plotting error: {}", e))
            }
            ChartKind::Svg => {
                let root = SVGBackend::new(path, FIGURE_SIZE).into_drawing_area();
                draw_chart(root, records, exclude_weekends)
                    .map_err(|e| format!("plotting error: {}", e))
            }
        }
    };

    match panic::catch_unwind(panic::AssertUnwindSafe(render)) {
        Ok(result) => result,
        Err(_) => Err("plotting backend panicked".to_string()),
    }
}

fn draw_chart<DB>(
    root: DrawingArea<DB, plotters::coord::Shift>,
    records: &[SleepRecord],
    exclude_weekends: bool,
) -> Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    let window = rolling_window(exclude_weekends);
    let segments: Vec<(SleepKind, Vec<WeekSegment>)> = SleepKind::ALL
        .iter()
        .map(|&kind| (kind, monday_segments(records, kind, window)))
        .collect();

    let x_range = date_span(records, segments.iter().flat_map(|(_, s)| s.iter()));
    let y_max = y_ceiling(records);

    let area = root;
    area.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&area)
        .margin(25)
        .set_label_area_size(LabelAreaPosition::Left, 50)
        .set_label_area_size(LabelAreaPosition::Bottom, 40)
        .build_cartesian_2d(MonthAxis(x_range.clone()), 0.0..y_max)?;

    let axis_font = FontDesc::new(FontFamily::SansSerif, 16.0, FontStyle::Normal);
    chart
        .configure_mesh()
        .light_line_style(&TRANSPARENT)
        .bold_line_style(&TRANSPARENT)
        .label_style(axis_font.clone().color(&BLACK.mix(0.85)))
        .x_label_style(
            axis_font
                .clone()
                .color(&BLACK.mix(0.85))
                .pos(Pos::new(HPos::Left, VPos::Top)),
        )
        .y_label_formatter(&|v| format!("{:.0}", v))
        .y_labels(y_max as usize + 1)
        .x_desc("Date")
        .y_desc("Sleep time (h)")
        .draw()?;

    // Grid under the data: dashed lines at major ticks, short-dash low-alpha
    // lines at minor ticks. Monday lines may coincide with month lines.
    let major_style = BLACK.mix(0.45).stroke_width(1);
    let minor_style = BLACK.mix(GRID_ALPHA).stroke_width(1);
    for month in month_starts(&x_range) {
        chart.draw_series(DashedLineSeries::new(
            [(month, 0.0), (month, y_max)],
            6,
            6,
            major_style,
        ))?;
    }
    for monday in mondays(&x_range) {
        chart.draw_series(DashedLineSeries::new(
            [(monday, 0.0), (monday, y_max)],
            1,
            4,
            minor_style,
        ))?;
    }
    for hour in 1..=y_max as i64 {
        chart.draw_series(DashedLineSeries::new(
            [(x_range.start, hour as f64), (x_range.end, hour as f64)],
            6,
            6,
            major_style,
        ))?;
    }
    for tick in minor_hour_ticks(y_max) {
        chart.draw_series(DashedLineSeries::new(
            [(x_range.start, tick), (x_range.end, tick)],
            1,
            4,
            minor_style,
        ))?;
    }

    for (kind, kind_segments) in &segments {
        let color = kind_color(*kind);

        // Low-opacity markers overlap into density shading where nights
        // cluster, so the legend swatch is a solid line instead.
        chart
            .draw_series(records.iter().map(|r| {
                Circle::new((r.date, kind.value(r)), 3, color.mix(DATA_ALPHA).filled())
            }))?
            .label(kind.label())
            .legend(move |(x, y)| {
                PathElement::new(vec![(x, y), (x + 20, y)], color.stroke_width(2))
            });

        chart.draw_series(kind_segments.iter().map(|s| {
            PathElement::new(
                vec![(s.start, s.mean), (s.end, s.mean)],
                color.stroke_width(2),
            )
        }))?;

        // An empty category has no defined average; draw nothing for it.
        if let Some(mean) = series_mean(records, *kind) {
            chart.draw_series(DashedLineSeries::new(
                [(x_range.start, mean), (x_range.end, mean)],
                6,
                4,
                color.mix(DATA_ALPHA).stroke_width(1),
            ))?;
        }
    }

    let legend_font = FontDesc::new(FontFamily::SansSerif, 15.0, FontStyle::Normal);
    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.7))
        .border_style(&BLACK.mix(0.3))
        .label_font(legend_font.color(&BLACK))
        .position(SeriesLabelPosition::UpperLeft)
        .draw()?;

    area.present()?;
    Ok(())
}

fn kind_color(kind: SleepKind) -> RGBColor {
    let (r, g, b) = kind.color();
    RGBColor(r, g, b)
}

/// Chart date range covering every scatter point and segment end.
fn date_span<'a>(
    records: &[SleepRecord],
    segments: impl Iterator<Item = &'a WeekSegment>,
) -> Range<NaiveDate> {
    let mut min: Option<NaiveDate> = None;
    let mut max: Option<NaiveDate> = None;
    let mut widen = |date: NaiveDate| {
        min = Some(min.map_or(date, |m| m.min(date)));
        max = Some(max.map_or(date, |m| m.max(date)));
    };
    for record in records {
        widen(record.date);
    }
    for segment in segments {
        widen(segment.start);
        widen(segment.end);
    }
    match (min, max) {
        // One padding day on each side keeps edge markers inside the frame.
        (Some(min), Some(max)) => min - Duration::days(1)..max + Duration::days(1),
        // An empty table still renders a valid frame over a placeholder week.
        _ => NaiveDate::default()..NaiveDate::default() + Duration::days(7),
    }
}

/// Top of the y axis: one whole hour above the longest night, never below 0.
fn y_ceiling(records: &[SleepRecord]) -> f64 {
    let max = records
        .iter()
        .map(|r| r.total_h)
        .fold(f64::NEG_INFINITY, f64::max);
    if max.is_finite() && max > 0.0 {
        max.ceil() + 1.0
    } else {
        8.0
    }
}

fn month_starts(range: &Range<NaiveDate>) -> Vec<NaiveDate> {
    let mut cursor = NaiveDate::from_ymd_opt(range.start.year(), range.start.month(), 1)
        .unwrap_or(range.start);
    if cursor < range.start {
        cursor = next_month(cursor);
    }
    let mut out = Vec::new();
    while cursor < range.end {
        out.push(cursor);
        cursor = next_month(cursor);
    }
    out
}

fn next_month(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    // Day 1 exists in every month.
    NaiveDate::from_ymd_opt(year, month, 1).unwrap()
}

fn mondays(range: &Range<NaiveDate>) -> Vec<NaiveDate> {
    let offset = (7 - range.start.weekday().num_days_from_monday()) % 7;
    let mut cursor = range.start + Duration::days(offset as i64);
    let mut out = Vec::new();
    while cursor < range.end {
        out.push(cursor);
        cursor = cursor + Duration::days(7);
    }
    out
}

/// Minor y ticks subdividing each hour into six 10-minute steps.
fn minor_hour_ticks(y_max: f64) -> Vec<f64> {
    let mut out = Vec::new();
    let mut hour = 0i64;
    while (hour as f64) < y_max {
        for sixth in 1..6 {
            let tick = hour as f64 + sixth as f64 / 6.0;
            if tick < y_max {
                out.push(tick);
            }
        }
        hour += 1;
    }
    out
}

/// Date axis whose key points are month boundaries, labeled `YYYY-MM`.
#[derive(Clone)]
struct MonthAxis(Range<NaiveDate>);

impl Ranged for MonthAxis {
    type FormatOption = NoDefaultFormatting;
    type ValueType = NaiveDate;

    fn map(&self, value: &NaiveDate, limit: (i32, i32)) -> i32 {
        let span = (self.0.end - self.0.start).num_days().max(1) as f64;
        let offset = (*value - self.0.start).num_days() as f64;
        limit.0 + ((limit.1 - limit.0) as f64 * offset / span).round() as i32
    }

    fn key_points<Hint: KeyPointHint>(&self, hint: Hint) -> Vec<NaiveDate> {
        if hint.max_num_points() == 0 {
            return Vec::new();
        }
        month_starts(&self.0)
    }

    fn range(&self) -> Range<NaiveDate> {
        self.0.clone()
    }
}

impl ValueFormatter<NaiveDate> for MonthAxis {
    fn format_ext(&self, value: &NaiveDate) -> String {
        value.format("%Y-%m").to_string()
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;

    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record(day: NaiveDate, total_h: f64) -> SleepRecord {
        SleepRecord {
            date: day,
            start: DateTime::from_timestamp(0, 0).unwrap(),
            stop: DateTime::from_timestamp(0, 0).unwrap(),
            deep_h: total_h / 2.0,
            shallow_h: total_h / 2.0,
            total_h,
        }
    }

    #[test]
    fn test_chart_kind_by_extension() {
        assert_eq!(chart_kind_for(Path::new("out.svg")), ChartKind::Svg);
        assert_eq!(chart_kind_for(Path::new("out.SVG")), ChartKind::Svg);
        assert_eq!(chart_kind_for(Path::new("out.png")), ChartKind::Bitmap);
        assert_eq!(chart_kind_for(Path::new("out")), ChartKind::Bitmap);
    }

    #[test]
    fn test_cli_date_parser_is_strict() {
        assert_eq!(parse_cli_date("2023-01-10"), Ok(date(2023, 1, 10)));
        assert!(parse_cli_date("2023/01/10").is_err());
        assert!(parse_cli_date("10-01-2023").is_err());
    }

    #[test]
    fn test_month_starts_inside_range() {
        let range = date(2022, 11, 15)..date(2023, 2, 10);
        assert_eq!(
            month_starts(&range),
            vec![date(2022, 12, 1), date(2023, 1, 1), date(2023, 2, 1)]
        );
    }

    #[test]
    fn test_month_starts_includes_range_start_boundary() {
        let range = date(2023, 1, 1)..date(2023, 3, 2);
        assert_eq!(
            month_starts(&range),
            vec![date(2023, 1, 1), date(2023, 2, 1), date(2023, 3, 1)]
        );
    }

    #[test]
    fn test_mondays_enumeration() {
        // 2023-01-03 is a Tuesday.
        let range = date(2023, 1, 3)..date(2023, 1, 17);
        assert_eq!(mondays(&range), vec![date(2023, 1, 9), date(2023, 1, 16)]);
        // A range starting on a Monday includes that Monday.
        let range = date(2023, 1, 2)..date(2023, 1, 10);
        assert_eq!(mondays(&range), vec![date(2023, 1, 2), date(2023, 1, 9)]);
    }

    #[test]
    fn test_minor_ticks_subdivide_hours_by_six() {
        let ticks = minor_hour_ticks(2.0);
        assert_eq!(ticks.len(), 10);
        assert!((ticks[0] - 1.0 / 6.0).abs() < 1e-9);
        assert!(ticks.iter().all(|t| *t > 0.0 && *t < 2.0));
    }

    #[test]
    fn test_date_span_pads_and_covers_segments() {
        let records = vec![record(date(2023, 1, 9), 3.0)];
        let segments = vec![WeekSegment {
            start: date(2023, 1, 2),
            end: date(2023, 1, 9),
            mean: 3.0,
        }];
        let span = date_span(&records, segments.iter());
        assert_eq!(span.start, date(2023, 1, 1));
        assert_eq!(span.end, date(2023, 1, 10));
    }

    #[test]
    fn test_date_span_empty_table_has_fallback() {
        let span = date_span(&[], [].iter());
        assert!(span.start < span.end);
    }

    #[test]
    fn test_y_ceiling() {
        assert_eq!(y_ceiling(&[]), 8.0);
        let records = vec![record(date(2023, 1, 9), 7.5)];
        assert_eq!(y_ceiling(&records), 9.0);
    }

    #[test]
    fn test_month_axis_maps_linearly() {
        let axis = MonthAxis(date(2023, 1, 1)..date(2023, 1, 11));
        assert_eq!(axis.map(&date(2023, 1, 1), (0, 100)), 0);
        assert_eq!(axis.map(&date(2023, 1, 6), (0, 100)), 50);
        assert_eq!(axis.map(&date(2023, 1, 11), (0, 100)), 100);
    }

    #[test]
    fn test_month_axis_formats_year_month() {
        let axis = MonthAxis(date(2023, 1, 1)..date(2023, 2, 1));
        assert_eq!(axis.format_ext(&date(2023, 1, 1)), "2023-01");
    }
}
