use std::io::IsTerminal;

use comfy_table::{presets::NOTHING, Attribute, Cell, Table};

/// Whether table headers and keys are printed bold.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TableStyle {
    pub bold: bool,
}

impl TableStyle {
    pub(crate) fn detect() -> Self {
        style_for(
            std::io::stdout().is_terminal(),
            std::env::var_os("NO_COLOR").is_some(),
        )
    }

    fn cell(self, text: &str) -> Cell {
        let cell = Cell::new(text);
        if self.bold {
            cell.add_attribute(Attribute::Bold)
        } else {
            cell
        }
    }

    pub(crate) fn columns(self, headers: &[&str]) -> Table {
        let mut table = Table::new();
        table.load_preset(NOTHING);
        table.set_header(headers.iter().map(|h| self.cell(h)).collect::<Vec<_>>());
        table
    }

    pub(crate) fn fields(self) -> Table {
        let mut table = Table::new();
        table.load_preset(NOTHING);
        table
    }

    pub(crate) fn field(self, table: &mut Table, name: &str, value: impl ToString) {
        table.add_row(vec![self.cell(name), Cell::new(value.to_string())]);
    }
}

fn style_for(is_tty: bool, no_color: bool) -> TableStyle {
    TableStyle {
        bold: is_tty && !no_color,
    }
}
