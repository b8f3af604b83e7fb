//! Approximate placement of line-range highlights on PDF pages.
//!
//! Answers cite documents by line range, but a PDF has no notion of lines.
//! The text of each page is extracted and its non-empty lines are counted; a
//! cited range is then mapped to a page and to a vertical band on that page,
//! assuming lines are spread evenly over the printable area. The preview pane
//! draws the band as an overlay rectangle.
//!
//! This is a heuristic. Multi-column layouts, tables and scanned pages will be
//! off, and pages with no extractable text fall back to a configured
//! lines-per-page figure. Such results are flagged `approximate`.

use serde::Serialize;
use thiserror::Error;

use crate::models::LineRange;

/// Fraction of the page height treated as top and bottom margin.
pub const PAGE_MARGIN: f64 = 0.06;

#[derive(Debug, Error)]
pub enum HighlightError {
    #[error("could not read PDF: {0}")]
    Pdf(String),
    #[error("PDF has no pages")]
    NoPages,
}

/// Where to draw a highlight. `top` and `height` are fractions of the page
/// height, measured from the top edge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HighlightRegion {
    /// 1-based page number.
    pub page: u32,
    pub page_count: u32,
    pub top: f64,
    pub height: f64,
    /// The part of the requested range that falls on `page`, in document
    /// line numbers.
    pub lines: LineRange,
    pub approximate: bool,
}

/// Counts non-empty text lines on each page, in page order.
pub fn page_line_counts(pdf: &[u8]) -> Result<Vec<usize>, HighlightError> {
    let doc = lopdf::Document::load_mem(pdf).map_err(|e| HighlightError::Pdf(e.to_string()))?;
    let pages = doc.get_pages();
    if pages.is_empty() {
        return Err(HighlightError::NoPages);
    }

    let counts = pages
        .keys()
        .map(|&page| match doc.extract_text(&[page]) {
            Ok(text) => text.lines().filter(|l| !l.trim().is_empty()).count(),
            Err(e) => {
                tracing::debug!(page, error = %e, "no extractable text on page");
                0
            }
        })
        .collect();
    Ok(counts)
}

/// Maps a document line range onto a page.
///
/// A range that starts on one page and continues onto the next is clipped at
/// the end of the first page. A range past the end of the document is placed
/// on the last line of the last page.
pub fn locate(range: LineRange, counts: &[usize], fallback_lines_per_page: usize) -> HighlightRegion {
    let fallback = fallback_lines_per_page.max(1);
    let single = [0usize];
    let counts = if counts.is_empty() { &single[..] } else { counts };
    let page_count = counts.len() as u32;

    let mut approximate = false;
    let mut offset: u64 = 0;
    for (idx, &raw) in counts.iter().enumerate() {
        if raw == 0 {
            approximate = true;
        }
        let lines_on_page = effective(raw, fallback);

        let first = offset + 1;
        let last = offset + lines_on_page;
        if u64::from(range.start) <= last {
            let start = u64::from(range.start).max(first);
            let end = u64::from(range.end).min(last);
            return region(
                idx as u32 + 1,
                page_count,
                (start - offset, end - offset),
                lines_on_page,
                offset,
                approximate,
            );
        }
        offset = last;
    }

    // Past the end: last line of the last page.
    let last_count = effective(counts[counts.len() - 1], fallback);
    region(
        page_count,
        page_count,
        (last_count, last_count),
        last_count,
        offset - last_count,
        true,
    )
}

fn effective(raw: usize, fallback: usize) -> u64 {
    let n = if raw == 0 { fallback } else { raw };
    n as u64
}

fn region(
    page: u32,
    page_count: u32,
    (local_start, local_end): (u64, u64),
    lines_on_page: u64,
    page_offset: u64,
    approximate: bool,
) -> HighlightRegion {
    let per_line = (1.0 - 2.0 * PAGE_MARGIN) / lines_on_page as f64;
    HighlightRegion {
        page,
        page_count,
        top: PAGE_MARGIN + (local_start - 1) as f64 * per_line,
        height: (local_end - local_start + 1) as f64 * per_line,
        lines: LineRange::new(
            (local_start + page_offset) as u32,
            (local_end + page_offset) as u32,
        ),
        approximate,
    }
}

/// Convenience wrapper: extract line counts from `pdf` and locate `range`.
/// Unreadable PDFs are located with the fallback figure alone.
pub fn locate_in_pdf(pdf: &[u8], range: LineRange, fallback_lines_per_page: usize) -> HighlightRegion {
    match page_line_counts(pdf) {
        Ok(counts) => locate(range, &counts, fallback_lines_per_page),
        Err(e) => {
            tracing::warn!(error = %e, "highlight falls back to fixed lines per page");
            locate(range, &[], fallback_lines_per_page)
        }
    }
}
