use std::time::Duration;

use reqwest::redirect::Policy;
use reqwest::{Client, Url};

use tracing::{debug, info};

use crate::device::DeviceRecord;
use crate::error::{Error, ErrorKind, Result};

/// Name of the column holding device identifiers.
pub const DEVICE_ID_COLUMN: &str = "DeviceId";

/// Name of the optional column holding device statuses.
pub const STATUS_COLUMN: &str = "Status";

/// Timeout applied to a spreadsheet download.
pub const SHEET_TIMEOUT: Duration = Duration::from_secs(10);

// Maximum number of redirects followed by a spreadsheet download.
const MAX_REDIRECTS: usize = 10;

const BOM: char = '\u{feff}';

/// Parses raw CSV bytes into a list of [`DeviceRecord`]s.
///
/// # Errors
///
/// An error is returned when the bytes are not valid UTF-8 or when the
/// header lacks the [`DEVICE_ID_COLUMN`].
pub fn parse_csv_bytes(bytes: &[u8]) -> Result<Vec<DeviceRecord>> {
    let text = std::str::from_utf8(bytes).map_err(|e| {
        Error::new(
            ErrorKind::Ingestion,
            format!("The CSV content is not valid UTF-8: {e}"),
        )
    })?;
    parse_csv_devices(text)
}

/// Parses CSV text into a list of [`DeviceRecord`]s.
///
/// The header row must contain a [`DEVICE_ID_COLUMN`] column and may contain
/// a [`STATUS_COLUMN`] column. Header names are compared after trimming them
/// and stripping a leading byte order mark. Rows with an empty identifier are
/// dropped, an empty status is read as absent.
///
/// # Errors
///
/// An error is returned when the header lacks the [`DEVICE_ID_COLUMN`] or
/// when a quoted field is never closed.
pub fn parse_csv_devices(text: &str) -> Result<Vec<DeviceRecord>> {
    let mut rows = parse_rows(text.strip_prefix(BOM).unwrap_or(text))?.into_iter();

    let header = rows.next().unwrap_or_default();
    let column = |name: &str| {
        header
            .iter()
            .position(|field| field.trim_matches(|c: char| c == BOM || c.is_whitespace()) == name)
    };

    let Some(id_column) = column(DEVICE_ID_COLUMN) else {
        return Err(Error::new(
            ErrorKind::Ingestion,
            format!("Missing `{DEVICE_ID_COLUMN}` column"),
        ));
    };
    let status_column = column(STATUS_COLUMN);

    let mut records = Vec::new();
    for row in rows {
        let id = row.get(id_column).map_or("", |id| id.trim());
        if id.is_empty() {
            continue;
        }

        let status = status_column
            .and_then(|index| row.get(index))
            .map(|status| status.trim())
            .filter(|status| !status.is_empty());

        records.push(DeviceRecord {
            id: id.into(),
            status: status.map(Into::into),
        });
    }

    debug!("Parsed {} device records", records.len());
    Ok(records)
}

// Splits text into rows of fields. A quote opens a quoted field only at the
// start of a field; quoted fields may contain separators, line breaks, and
// doubled quotes. Elsewhere a quote is an ordinary character. Blank lines are
// skipped.
fn parse_rows(text: &str) -> Result<Vec<Vec<String>>> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    // Record number of the currently open quoted field.
    let mut open_quote: Option<usize> = None;
    let mut started = false;

    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if open_quote.is_some() {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    let _ = chars.next();
                    field.push('"');
                }
                '"' => open_quote = None,
                _ => field.push(c),
            }
            continue;
        }

        match c {
            '"' if !started => {
                open_quote = Some(rows.len() + 1);
                started = true;
            }
            ',' => {
                row.push(std::mem::take(&mut field));
                started = false;
            }
            '\r' if chars.peek() == Some(&'\n') => {}
            '\r' | '\n' => {
                row.push(std::mem::take(&mut field));
                push_row(&mut rows, std::mem::take(&mut row));
                started = false;
            }
            _ => {
                field.push(c);
                started = true;
            }
        }
    }

    if let Some(record) = open_quote {
        return Err(Error::new(
            ErrorKind::Ingestion,
            format!("Unterminated quoted field in CSV record {record}"),
        ));
    }

    if started || !row.is_empty() {
        row.push(field);
        push_row(&mut rows, row);
    }

    Ok(rows)
}

fn push_row(rows: &mut Vec<Vec<String>>, row: Vec<String>) {
    if row.iter().any(|field| !field.is_empty()) {
        rows.push(row);
    }
}

/// Downloads the CSV export of a shared spreadsheet.
#[derive(Debug, Clone)]
pub struct SheetFetcher {
    client: Client,
}

impl SheetFetcher {
    /// Creates a [`SheetFetcher`] with a [`SHEET_TIMEOUT`] timeout that
    /// follows redirects.
    ///
    /// # Errors
    ///
    /// An error is returned if the HTTP client cannot be initialized.
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(SHEET_TIMEOUT)
            .redirect(Policy::limited(MAX_REDIRECTS))
            .build()?;
        Ok(Self { client })
    }

    /// Downloads the CSV text found at `url`.
    ///
    /// # Errors
    ///
    /// An error is returned when the download fails or the server answers
    /// with a non-successful status code.
    pub async fn fetch_csv(&self, url: &str) -> Result<String> {
        let url = url.trim();
        if url.is_empty() {
            return Err(Error::new(ErrorKind::Ingestion, "Empty sheet URL"));
        }

        let parsed = Url::parse(url).map_err(|e| {
            Error::new(ErrorKind::Ingestion, format!("Invalid sheet URL `{url}`: {e}"))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::new(
                ErrorKind::Ingestion,
                format!("Unsupported sheet URL scheme `{}`", parsed.scheme()),
            ));
        }

        info!("Downloading sheet `{url}`");
        let response = self.client.get(parsed).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::remote(
                status.as_u16(),
                format!("Unable to download the sheet `{url}`"),
            ));
        }

        Ok(response.text().await?)
    }

    /// Downloads the CSV text found at `url` and parses it into a list of
    /// [`DeviceRecord`]s.
    ///
    /// # Errors
    ///
    /// An error is returned when the download fails or its content is not
    /// a valid device list.
    pub async fn fetch_devices(&self, url: &str) -> Result<Vec<DeviceRecord>> {
        let text = self.fetch_csv(url).await?;
        parse_csv_devices(&text)
    }
}
