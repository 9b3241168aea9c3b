//! COPY statement construction.

use serde::Serialize;

/// Text format options passed through to `COPY ... WITH`.
#[derive(Debug, Clone, Serialize)]
pub struct CopyFormat {
    /// Field delimiter.
    pub delimiter: u8,
    /// Extra options appended verbatim, `CSV` by default.
    pub options: String,
    pub quote: Option<u8>,
    pub escape: Option<u8>,
}

impl Default for CopyFormat {
    fn default() -> Self {
        Self {
            delimiter: b',',
            options: "CSV".to_string(),
            quote: None,
            escape: None,
        }
    }
}

/// Destination table of a load.
#[derive(Debug, Clone, Serialize)]
pub struct CopyTarget {
    pub schema: String,
    pub table: String,
    pub columns: Option<Vec<String>>,
    pub format: CopyFormat,
}

impl Default for CopyTarget {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
            table: "test_table".to_string(),
            columns: None,
            format: CopyFormat::default(),
        }
    }
}

impl CopyTarget {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            ..Self::default()
        }
    }

    /// `"schema"."table"`
    pub fn qualified_name(&self) -> String {
        format!(
            "{}.{}",
            quote_identifier(&self.schema),
            quote_identifier(&self.table)
        )
    }

    pub fn copy_statement(&self) -> String {
        let mut statement = format!("COPY {}", self.qualified_name());

        if let Some(columns) = &self.columns {
            statement.push('(');
            statement.push_str(&columns.join(","));
            statement.push(')');
        }

        statement.push_str(" FROM STDIN WITH DELIMITER ");
        statement.push_str(&quote_literal(self.format.delimiter));

        let options = self.format.options.trim();
        if !options.is_empty() {
            statement.push(' ');
            statement.push_str(options);
        }
        if let Some(quote) = self.format.quote {
            statement.push_str(" QUOTE ");
            statement.push_str(&quote_literal(quote));
        }
        if let Some(escape) = self.format.escape {
            statement.push_str(" ESCAPE ");
            statement.push_str(&quote_literal(escape));
        }

        statement
    }

    pub fn truncate_statement(&self) -> String {
        format!("TRUNCATE {}", self.qualified_name())
    }
}

/// Double-quote an identifier, doubling embedded quotes.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(byte: u8) -> String {
    let c = byte as char;
    if c == '\'' {
        "''''".to_string()
    } else {
        format!("'{}'", c)
    }
}

/// Split a comma separated column list. Blank input means "all columns".
pub fn parse_column_list(raw: &str) -> Option<Vec<String>> {
    let columns: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|column| !column.is_empty())
        .map(str::to_string)
        .collect();

    if columns.is_empty() { None } else { Some(columns) }
}
