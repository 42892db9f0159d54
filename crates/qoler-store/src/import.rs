//! Bulk user import from `id,username,password` CSV text.

/// One well-formed row, password still in clear text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvUser {
    pub id: i64,
    pub username: String,
    pub password: String,
}

/// Parse CSV text into user rows.
///
/// A leading header line (first field not an integer) is ignored. Blank
/// lines are ignored. Rows with the wrong field count, a non-integer id, or
/// an empty field are counted as skipped.
pub fn parse_user_csv(text: &str) -> (Vec<CsvUser>, usize) {
    let mut rows = Vec::new();
    let mut skipped = 0;

    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty()).peekable();
    let has_header = lines
        .peek()
        .is_some_and(|first| first.split(',').next().unwrap_or_default().trim().parse::<i64>().is_err());
    if has_header {
        lines.next();
    }

    for line in lines {
        match parse_row(line) {
            Some(row) => rows.push(row),
            None => skipped += 1,
        }
    }
    (rows, skipped)
}

fn parse_row(line: &str) -> Option<CsvUser> {
    let fields: Vec<&str> = line.split(',').map(|f| f.trim().trim_matches('"')).collect();
    let [id, username, password] = fields.as_slice() else {
        return None;
    };
    if username.is_empty() || password.is_empty() {
        return None;
    }
    Some(CsvUser {
        id: id.parse().ok()?,
        username: username.to_string(),
        password: password.to_string(),
    })
}
