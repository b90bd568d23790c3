//! Desugaring of comment tags into the schema tree.
//!
//! Table comments recognize `index`, `inline` (this table parents the
//! inline) and `join`; column comments recognize `index` (include, rename,
//! pk/routing/id roles), `inline` (this column participates; the table
//! becomes the inline's source) and `join` (name/parent binding). Tags are
//! desugared into plain struct fields here; nothing is re-parsed at
//! streaming time.

use crate::conftags::{self, Tag};
use crate::error::{Error, Result};

use super::{Database, TableId};

impl Database {
    /// Applies a table comment. Parsed at most once per table; discovery
    /// repeats the comment on every column row.
    pub fn apply_table_tags(&mut self, tid: TableId, comment: Option<&str>) -> Result<()> {
        if self.tables[tid].tag_parsed {
            return Ok(());
        }
        self.tables[tid].tag_parsed = true;

        let Some(comment) = comment else {
            return Ok(());
        };
        let tags = conftags::parse(comment)?;

        self.apply_table_index_tag(tid, &tags);
        self.apply_table_inline_tags(tid, &tags)?;
        self.apply_table_join_tag(tid, &tags);
        Ok(())
    }

    fn apply_table_index_tag(&mut self, tid: TableId, tags: &[Tag]) {
        let Some(tag) = conftags::get(tags, "index") else {
            return;
        };
        let table = &mut self.tables[tid];

        // `index:"-"` skips the table entirely
        if tag.first() == "-" {
            table.index = false;
            return;
        }
        if !tag.first().is_empty() {
            table.doc_type = tag.first().to_string();
        }
        for opt in tag.options() {
            if opt == "all" {
                table.index_all = true;
            }
        }
    }

    /// A table-level `inline` tag declares this table as the parent the
    /// named inline injects into.
    fn apply_table_inline_tags(&mut self, tid: TableId, tags: &[Tag]) -> Result<()> {
        let schema = self.tables[tid].schema.clone();
        let inline_tags: Vec<Tag> = conftags::filter(tags, "inline").cloned().collect();
        for tag in inline_tags {
            if tag.first().is_empty() {
                return Err(Error::config(format!(
                    "table {}: inline tag needs a name",
                    self.tables[tid].name
                )));
            }
            let iid = self.inline_entry(&schema, tag.first());

            self.inlines[iid].parent = Some(tid);
            if !self.tables[tid].inlines.contains(&iid) {
                self.tables[tid].inlines.push(iid);
            }

            // first option renames the document field
            if let Some(field) = tag.values.get(1) {
                self.inlines[iid].field_name = field.clone();
            }
            // second and third override the stored-script ids
            if tag.values.len() > 3 {
                self.inlines[iid].script_add = tag.values[2].clone();
                self.inlines[iid].script_del = tag.values[3].clone();
            }
        }
        Ok(())
    }

    fn apply_table_join_tag(&mut self, tid: TableId, tags: &[Tag]) {
        // only one join is allowed per document
        let Some(tag) = conftags::get(tags, "join") else {
            return;
        };
        let table = &mut self.tables[tid];
        table.join.enabled = true;
        table.join.field_name = "join".to_string();
        table.join.type_name = table.doc_type.clone();

        if !tag.first().is_empty() {
            table.join.field_name = tag.first().to_string();
        }
        if let Some(type_name) = tag.values.get(1) {
            table.join.type_name = type_name.clone();
        }
    }

    /// Applies a column comment.
    pub fn apply_column_tags(
        &mut self,
        tid: TableId,
        cid: usize,
        comment: Option<&str>,
    ) -> Result<()> {
        let Some(comment) = comment else {
            return Ok(());
        };
        let tags = conftags::parse(comment).map_err(|e| {
            Error::config(format!(
                "parse column {}.{} tags: {}",
                self.tables[tid].name, self.tables[tid].columns[cid].name, e
            ))
        })?;

        self.apply_column_index_tag(tid, cid, &tags);
        self.apply_column_inline_tags(tid, cid, &tags)?;
        self.apply_column_join_tag(tid, cid, &tags);
        Ok(())
    }

    fn apply_column_index_tag(&mut self, tid: TableId, cid: usize, tags: &[Tag]) {
        let Some(tag) = conftags::get(tags, "index") else {
            return;
        };
        let table = &mut self.tables[tid];
        table.columns[cid].index = true;

        if !tag.first().is_empty() {
            table.columns[cid].field_name = tag.first().to_string();
        }
        for opt in tag.options() {
            match opt.as_str() {
                // `id` means the raw value IS the document id
                "id" => {
                    table.pk_no_prefix = true;
                    table.pk_col = Some(cid);
                }
                "pk" => table.pk_col = Some(cid),
                "routing" => table.routing_col = Some(cid),
                _ => {}
            }
        }

        // `index:"-"` skips this column
        if tag.first() == "-" {
            table.columns[cid].index = false;
            table.columns[cid].field_name = String::new();
        }
    }

    /// A column-level `inline` tag makes the owning table the inline's
    /// source and binds the column into it.
    fn apply_column_inline_tags(&mut self, tid: TableId, cid: usize, tags: &[Tag]) -> Result<()> {
        let schema = self.tables[tid].schema.clone();
        let inline_tags: Vec<Tag> = conftags::filter(tags, "inline").cloned().collect();
        for tag in inline_tags {
            if tag.first().is_empty() {
                return Err(Error::config(format!(
                    "column {}.{}: inline tag needs a name",
                    self.tables[tid].name, self.tables[tid].columns[cid].name
                )));
            }
            let iid = self.inline_entry(&schema, tag.first());

            if self.inlines[iid].source.is_none() {
                self.inlines[iid].source = Some(tid);
                self.tables[tid].inlined_in.push(iid);
            }
            if self.inlines[iid].source != Some(tid) {
                return Err(Error::config(format!(
                    "inline {}: only one table can be the inline source",
                    self.inlines[iid].name
                )));
            }

            let mut field = self.tables[tid].columns[cid].name.clone();
            for opt in tag.options() {
                match opt.as_str() {
                    "pk" => self.inlines[iid].pk_col = Some(cid),
                    "parent" => self.inlines[iid].parent_col = Some(cid),
                    "routing" => self.inlines[iid].routing_col = Some(cid),
                    rename => field = rename.to_string(),
                }
            }
            self.inlines[iid].bind_column(&field, cid);
        }
        Ok(())
    }

    fn apply_column_join_tag(&mut self, tid: TableId, cid: usize, tags: &[Tag]) {
        let Some(tag) = conftags::get(tags, "join") else {
            return;
        };
        let table = &mut self.tables[tid];
        table.join.enabled = true;
        if table.join.field_name.is_empty() {
            table.join.field_name = "join".to_string();
        }
        if table.join.type_name.is_empty() {
            table.join.type_name = table.doc_type.clone();
        }
        match tag.first() {
            "name" => table.join.name_col = Some(cid),
            "parent" => table.join.parent_col = Some(cid),
            _ => {}
        }
    }
}
