//! CSV output format for checkpoint reports
//!
//! One row per syscall. With `--sysnum` the number column comes first, the
//! same as in the text table.

use crate::report::{Report, ReportRow};

/// CSV output formatter
#[derive(Debug)]
pub struct CsvOutput {
    include_sysnum: bool,
}

impl CsvOutput {
    pub fn new(include_sysnum: bool) -> Self {
        Self { include_sysnum }
    }

    /// Generate CSV header row based on enabled flags
    fn header(&self) -> String {
        let mut headers = Vec::with_capacity(6);
        if self.include_sysnum {
            headers.push("sysnum");
        }
        headers.extend(["syscall", "count", "overhead_us", "avg_overhead_us"]);
        headers.join(",")
    }

    /// Escape CSV field (handle commas, quotes, newlines)
    fn escape_field(field: &str) -> String {
        if field.contains(',') || field.contains('"') || field.contains('\n') {
            format!("\"{}\"", field.replace('"', "\"\""))
        } else {
            field.to_string()
        }
    }

    fn format_row(&self, row: &ReportRow) -> String {
        let mut fields = Vec::with_capacity(5);
        if self.include_sysnum {
            fields.push(row.sysnum.to_string());
        }
        fields.push(Self::escape_field(&row.sysname));
        fields.push(row.count.to_string());
        fields.push(format!("{:.3}", row.overhead_us));
        fields.push(format!("{:.3}", row.avg_overhead_us));
        fields.join(",")
    }

    /// Generate CSV output as string
    pub fn to_csv(&self, report: &Report) -> String {
        let mut output = String::new();
        output.push_str(&self.header());
        output.push('\n');
        for row in &report.rows {
            output.push_str(&self.format_row(row));
            output.push('\n');
        }
        output
    }
}
