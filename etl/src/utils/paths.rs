/// Directory name used for a partition whose value is null.
pub const NULL_PARTITION_VALUE: &str = "__HIVE_DEFAULT_PARTITION__";

/// Marker object committed after every part file of a table is durable.
pub const SUCCESS_MARKER: &str = "_SUCCESS";

/// Builds hive-style relative paths (`table/col=value/.../file`) under an
/// output root.
#[derive(Debug, Clone)]
pub struct PathBuilder {
    table: String,
    partitions: Vec<(String, String)>,
}

impl PathBuilder {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            partitions: Vec::new(),
        }
    }

    pub fn with_partition(mut self, column: &str, value: Option<&str>) -> Self {
        self.partitions.push((
            column.to_string(),
            value.unwrap_or(NULL_PARTITION_VALUE).to_string(),
        ));
        self
    }

    /// Path segments of a file, one per directory level. Partition values are
    /// kept whole so the object store can escape any delimiter inside them.
    pub fn build_file_segments(&self, filename: &str) -> Vec<String> {
        let mut segments = vec![self.table.clone()];
        segments.extend(
            self.partitions
                .iter()
                .map(|(column, value)| format!("{}={}", column, value)),
        );
        segments.push(filename.to_string());
        segments
    }

    pub fn build_marker_path(&self) -> String {
        format!("{}/{}", self.table, SUCCESS_MARKER)
    }
}

pub fn part_file_name(index: usize, run_id: &str) -> String {
    format!("part-{:05}-{}.parquet", index, run_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_hive_style_paths() {
        let path = PathBuilder::new("songplays")
            .with_partition("year", Some("2018"))
            .with_partition("month", Some("11"));
        assert_eq!(
            path.build_file_segments(&part_file_name(3, "abc")).join("/"),
            "songplays/year=2018/month=11/part-00003-abc.parquet"
        );
        assert_eq!(path.build_marker_path(), "songplays/_SUCCESS");
    }

    #[test]
    fn null_values_use_default_partition() {
        let path = PathBuilder::new("songs")
            .with_partition("year", None)
            .with_partition("publisher_id", Some("AR1"));
        assert_eq!(
            path.build_file_segments("part-00000-x.parquet")[1..3],
            ["year=__HIVE_DEFAULT_PARTITION__", "publisher_id=AR1"]
        );
    }

    #[test]
    fn file_segments_keep_delimiters_inside_values() {
        let path = PathBuilder::new("songs").with_partition("publisher_id", Some("AC/DC"));
        assert_eq!(
            path.build_file_segments("part-00000-x.parquet"),
            vec!["songs", "publisher_id=AC/DC", "part-00000-x.parquet"]
        );
    }

    #[test]
    fn unpartitioned_tables_write_at_table_root() {
        let path = PathBuilder::new("artists");
        assert_eq!(
            path.build_file_segments("part-00000-x.parquet"),
            vec!["artists", "part-00000-x.parquet"]
        );
    }
}
