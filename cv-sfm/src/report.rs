use crate::{ResidualHistogram, Statistics};
use cv_core::ViewId;
use log::*;
use std::io::{self, Write};

/// Width in pixels of the bar of the fullest histogram bin.
const BAR_WIDTH: usize = 400;

/// Writes a standalone HTML summary of a reconstruction.
///
/// Errors of the sink are logged and otherwise ignored.
pub fn write_html_report(mut sink: impl Write, statistics: &Statistics) {
    if let Err(e) = render(&mut sink, statistics).and_then(|()| sink.flush()) {
        warn!("failed to write the reconstruction report: {}", e);
    }
}

fn render(w: &mut impl Write, statistics: &Statistics) -> io::Result<()> {
    writeln!(w, "<!DOCTYPE html>")?;
    writeln!(w, "<html><head><meta charset=\"utf-8\"><title>Sequential SfM report</title>")?;
    writeln!(
        w,
        "<style>table{{border-collapse:collapse}}td,th{{border:1px solid #999;padding:2px 6px}}\
         .bar{{background:#4a7;height:10px}}</style>"
    )?;
    writeln!(w, "</head><body>")?;
    writeln!(w, "<h1>Sequential SfM report</h1>")?;

    writeln!(w, "<h2>Summary</h2>")?;
    writeln!(w, "<table>")?;
    let seed = statistics
        .seed
        .map_or_else(|| "none".to_owned(), |seed| seed.to_string());
    let rows = [
        ("final state", statistics.state.to_string()),
        ("seed", seed),
        ("registered views", statistics.registered_views.to_string()),
        ("landmarks", statistics.landmarks.to_string()),
        ("observations", statistics.observations.to_string()),
        ("resection batches", statistics.batches.to_string()),
        ("rms residual (px)", format!("{:.4}", statistics.rms)),
        ("mean residual (px)", format!("{:.4}", statistics.mean_residual)),
        ("max residual (px)", format!("{:.4}", statistics.max_residual)),
        ("unregistered views", view_list(&statistics.unregistered)),
        ("dropped views", view_list(&statistics.dropped)),
    ];
    for (name, value) in &rows {
        writeln!(w, "<tr><th>{}</th><td>{}</td></tr>", name, escape(value))?;
    }
    writeln!(w, "</table>")?;

    histogram(w, &statistics.histogram)?;

    writeln!(w, "<h2>Timings</h2>")?;
    writeln!(w, "<table><tr><th>stage</th><th>seconds</th></tr>")?;
    for (stage, elapsed) in &statistics.timings {
        writeln!(w, "<tr><td>{}</td><td>{:.3}</td></tr>", stage, elapsed.as_secs_f64())?;
    }
    writeln!(
        w,
        "<tr><th>total</th><th>{:.3}</th></tr></table>",
        statistics.total_time().as_secs_f64()
    )?;

    writeln!(w, "<h2>Events</h2>")?;
    if statistics.events.is_empty() {
        writeln!(w, "<p>none</p>")?;
    } else {
        writeln!(w, "<table><tr><th>state</th><th>kind</th><th>message</th></tr>")?;
        for event in &statistics.events {
            writeln!(
                w,
                "<tr><td>{}</td><td>{:?}</td><td>{}</td></tr>",
                event.state,
                event.kind,
                escape(&event.message)
            )?;
        }
        writeln!(w, "</table>")?;
    }
    writeln!(w, "</body></html>")
}

fn histogram(w: &mut impl Write, histogram: &ResidualHistogram) -> io::Result<()> {
    writeln!(w, "<h2>Residuals</h2>")?;
    let fullest = histogram
        .bins
        .iter()
        .copied()
        .chain(Some(histogram.overflow))
        .max()
        .unwrap_or(0)
        .max(1);
    writeln!(w, "<table><tr><th>px</th><th>count</th><th></th></tr>")?;
    let overflow = (
        format!("&ge; {:.1}", ResidualHistogram::UPPER_EDGE),
        histogram.overflow,
    );
    let rows = histogram
        .iter()
        .map(|(low, high, count)| (format!("{:.1} &ndash; {:.1}", low, high), count))
        .chain(Some(overflow));
    for (label, count) in rows {
        writeln!(
            w,
            "<tr><td>{}</td><td>{}</td><td><div class=\"bar\" style=\"width:{}px\"></div></td></tr>",
            label,
            count,
            count * BAR_WIDTH / fullest
        )?;
    }
    writeln!(w, "</table>")
}

fn view_list(views: &[ViewId]) -> String {
    if views.is_empty() {
        return "none".to_owned();
    }
    views
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EngineState, EventKind};

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn report_contains_the_counts_and_events() {
        let mut statistics = Statistics {
            state: EngineState::Done,
            registered_views: 5,
            landmarks: 250,
            unregistered: vec![ViewId(7)],
            ..Statistics::default()
        };
        statistics.histogram.extend([0.05, 0.15, 9.0]);
        statistics.record(
            EngineState::Reconstructing,
            EventKind::ResectionRejected,
            "view 7 <no consensus>".to_owned(),
        );
        let mut html = Vec::new();
        write_html_report(&mut html, &statistics);
        let html = String::from_utf8(html).unwrap();
        assert!(html.contains("<tr><th>registered views</th><td>5</td></tr>"));
        assert!(html.contains("<tr><th>unregistered views</th><td>7</td></tr>"));
        assert!(html.contains("view 7 &lt;no consensus&gt;"));
        assert!(html.contains("ResectionRejected"));
        assert!(html.ends_with("</body></html>\n"));
    }

    #[test]
    fn failing_sink_is_ignored() {
        write_html_report(Broken, &Statistics::default());
    }
}
