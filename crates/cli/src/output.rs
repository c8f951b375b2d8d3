//! Output formatting for CLI

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
    /// Plain text format
    Plain,
}

/// Trait for items that can be displayed in a table
pub trait TableDisplay {
    fn headers() -> Vec<&'static str>;
    fn row(&self) -> Vec<String>;
}

/// Render a single item
pub fn render_item<T: Serialize + TableDisplay>(item: &T, format: OutputFormat) -> String {
    render_list(std::slice::from_ref(item), format, false)
}

/// Print a single item
pub fn print_item<T: Serialize + TableDisplay>(item: &T, format: OutputFormat) {
    println!("{}", render_item(item, format));
}

/// Print a list of items
pub fn print_list<T: Serialize + TableDisplay>(items: &[T], format: OutputFormat) {
    if items.is_empty() && format != OutputFormat::Json {
        println!("No items found.");
        return;
    }
    println!("{}", render_list(items, format, true));
}

fn render_list<T: Serialize + TableDisplay>(items: &[T], format: OutputFormat, as_array: bool) -> String {
    match format {
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic);

            table.set_header(T::headers());
            for item in items {
                table.add_row(item.row());
            }

            table.to_string()
        }
        OutputFormat::Json => {
            let rendered = if as_array {
                serde_json::to_string_pretty(items)
            } else {
                serde_json::to_string_pretty(&items[0])
            };
            rendered.unwrap_or_default()
        }
        OutputFormat::Plain => items
            .iter()
            .map(|item| {
                T::headers()
                    .iter()
                    .zip(item.row())
                    .map(|(header, value)| format!("{}: {}", header, value))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .collect::<Vec<_>>()
            .join("\n---\n"),
    }
}

/// Print a serializable value as JSON, or a message otherwise
pub fn print_value<T: Serialize>(value: &T, message: &str, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value).unwrap_or_default()),
        _ => println!("{}", message),
    }
}

/// Print success message
pub fn print_success(message: &str) {
    println!("✅ {}", message);
}

/// Print error message
pub fn print_error(message: &str) {
    eprintln!("❌ {}", message);
}

/// Print warning message
pub fn print_warning(message: &str) {
    println!("⚠️  {}", message);
}

/// Print info message
pub fn print_info(message: &str) {
    println!("ℹ️  {}", message);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Row {
        name: String,
        ip: String,
    }

    impl TableDisplay for Row {
        fn headers() -> Vec<&'static str> {
            vec!["Name", "IP"]
        }

        fn row(&self) -> Vec<String> {
            vec![self.name.clone(), self.ip.clone()]
        }
    }

    fn row() -> Row {
        Row {
            name: "laptop".to_string(),
            ip: "10.8.0.2".to_string(),
        }
    }

    #[test]
    fn test_plain_output() {
        assert_eq!(render_item(&row(), OutputFormat::Plain), "Name: laptop\nIP: 10.8.0.2");
    }

    #[test]
    fn test_json_item_is_an_object() {
        let json: serde_json::Value = serde_json::from_str(&render_item(&row(), OutputFormat::Json)).unwrap();
        assert_eq!(json["ip"], "10.8.0.2");
    }

    #[test]
    fn test_table_has_headers() {
        let table = render_item(&row(), OutputFormat::Table);
        assert!(table.contains("Name"));
        assert!(table.contains("laptop"));
    }
}
