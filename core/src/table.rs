//! Table - Rectangular Aggregation of Tree Outputs
//!
//! Walks a tree in pre-order and packs the scattered, variable-
//! cardinality element outputs into equal-length columns. Callable at
//! any time, including mid-flow; branches not yet grown simply
//! contribute nothing, and re-collection is idempotent.

use crate::arena::{BranchId, Tree};
use serde::Serialize;
use serde_json::Value;

/// One output column, in first-seen order.
#[derive(Debug, Clone, Serialize)]
pub struct Column {
    pub name: String,
    pub values: Vec<Value>,
    /// Pad by repeating the last value instead of the null marker.
    fill: bool,
}

/// The rectangular output of one tree.
///
/// Column length and padding are fully determined by traversal order
/// and each element's `n_rows`/`fill_rows`, independent of wall-clock
/// timing.
#[derive(Debug, Clone, Serialize, Default)]
pub struct Table {
    columns: Vec<Column>,
}

impl Table {
    /// Aggregate every step currently attached to `tree`.
    pub fn collect(tree: &Tree) -> Table {
        let mut table = Table::default();
        table.walk(tree, tree.root());
        table.pad();
        table
    }

    fn walk(&mut self, tree: &Tree, branch: BranchId) {
        for &step_id in &tree.branch(branch).steps {
            let step = tree.step(step_id);
            for el in &step.elements {
                let Some(name) = &el.name else { continue };
                let column = self.column_entry(name);
                column.fill = el.fill_rows;
                for _ in 0..el.n_rows {
                    column.values.push(el.value.clone());
                }
            }
            if let Some(children) = step.children {
                self.walk(tree, children);
            }
        }
    }

    fn column_entry(&mut self, name: &str) -> &mut Column {
        if let Some(idx) = self.columns.iter().position(|c| c.name == name) {
            return &mut self.columns[idx];
        }
        self.columns.push(Column {
            name: name.to_string(),
            values: Vec::new(),
            fill: false,
        });
        self.columns.last_mut().unwrap()
    }

    /// Pad every column to the longest column's length.
    fn pad(&mut self) {
        let rows = self.rows();
        for col in &mut self.columns {
            let filler = if col.fill {
                col.values.last().cloned().unwrap_or(Value::Null)
            } else {
                Value::Null
            };
            col.values.resize(rows, filler);
        }
    }

    /// Number of rows (all columns are equal-length after collection).
    pub fn rows(&self) -> usize {
        self.columns.iter().map(|c| c.values.len()).max().unwrap_or(0)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&[Value]> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.values.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Render as CSV with a header row. Null markers become empty
    /// cells; strings are quoted when they contain delimiters.
    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        let header: Vec<&str> = self.columns.iter().map(|c| c.name.as_str()).collect();
        push_csv_row(&mut out, header.into_iter().map(String::from));
        for row in 0..self.rows() {
            push_csv_row(
                &mut out,
                self.columns.iter().map(|c| csv_cell(&c.values[row])),
            );
        }
        out
    }
}

fn csv_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn push_csv_row(out: &mut String, cells: impl Iterator<Item = String>) {
    let mut first = true;
    for cell in cells {
        if !first {
            out.push(',');
        }
        first = false;
        if cell.contains(',') || cell.contains('"') || cell.contains('\n') {
            out.push('"');
            out.push_str(&cell.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(&cell);
        }
    }
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::Element;
    use crate::phase::{BranchSpec, StepSpec};

    #[test]
    fn columns_are_rectangular_after_padding() {
        let spec = BranchSpec::new().step(
            StepSpec::new("a")
                .element(Element::value("v1", 1))
                .element(Element::value("v2", "x").rows(3).fill()),
        );
        let tree = Tree::new(spec).unwrap();
        let table = Table::collect(&tree);

        assert_eq!(table.rows(), 3);
        for col in table.columns() {
            assert_eq!(col.values.len(), 3);
        }
    }

    #[test]
    fn fill_rows_repeats_last_value_others_pad_null() {
        let spec = BranchSpec::new().step(
            StepSpec::new("a")
                .element(Element::value("v1", 1))
                .element(Element::value("v2", "x").rows(3).fill()),
        );
        let tree = Tree::new(spec).unwrap();
        let table = Table::collect(&tree);

        assert_eq!(
            table.column("v1").unwrap(),
            &[Value::from(1), Value::Null, Value::Null]
        );
        assert_eq!(
            table.column("v2").unwrap(),
            &[Value::from("x"), Value::from("x"), Value::from("x")]
        );
    }

    #[test]
    fn walk_is_preorder_and_skips_unnamed() {
        let spec = BranchSpec::new()
            .step(
                StepSpec::new("a")
                    .element(Element::value("v", "root"))
                    .element(Element::display("decoration")),
            )
            .step(StepSpec::new("b").element(Element::value("v", "after")));
        let mut tree = Tree::new(spec).unwrap();
        let a = tree.branch(tree.root()).steps[0];
        tree.attach_children(
            a,
            BranchSpec::new().step(StepSpec::new("x").element(Element::value("v", "nested"))),
        );

        let table = Table::collect(&tree);
        assert_eq!(table.columns().len(), 1);
        assert_eq!(
            table.column("v").unwrap(),
            &[
                Value::from("root"),
                Value::from("nested"),
                Value::from("after")
            ]
        );
    }

    #[test]
    fn collect_is_idempotent() {
        let spec = BranchSpec::new().step(StepSpec::new("a").element(Element::value("v", 7)));
        let tree = Tree::new(spec).unwrap();
        let first = Table::collect(&tree);
        let second = Table::collect(&tree);
        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&second).unwrap()
        );
    }

    #[test]
    fn csv_quotes_delimiters() {
        let spec = BranchSpec::new().step(
            StepSpec::new("a")
                .element(Element::value("text", "hello, \"world\""))
                .element(Element::value("n", 3)),
        );
        let tree = Tree::new(spec).unwrap();
        let csv = Table::collect(&tree).to_csv();
        assert_eq!(csv, "text,n\n\"hello, \"\"world\"\"\",3\n");
    }
}
