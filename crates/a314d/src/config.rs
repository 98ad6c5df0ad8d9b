//! The service table.
//!
//! One on-demand service per line: the service name, then the program and
//! its arguments. Tokens are whitespace-separated; double quotes group a
//! token with spaces in it. A missing file just means an empty table.

use std::io;
use std::path::Path;

/// One configured on-demand service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnDemandStart {
    pub service_name: String,
    pub program: String,
    /// Full argv for the program; `arguments[0]` is the program itself.
    /// The launcher appends `-ondemand <fd>` at spawn time.
    pub arguments: Vec<String>,
}

pub fn load(path: &Path) -> Vec<OnDemandStart> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "could not read configuration");
            return Vec::new();
        }
    };

    let mut services = Vec::new();
    for line in text.lines() {
        let parts = tokenize(line);
        if parts.is_empty() {
            continue;
        }
        if parts.len() < 2 {
            tracing::warn!(line, "invalid number of columns in configuration line");
            continue;
        }

        services.push(OnDemandStart {
            service_name: parts[0].clone(),
            program: parts[1].clone(),
            arguments: parts[1..].to_vec(),
        });
    }
    services
}

fn tokenize(line: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in line.chars() {
        match c {
            '"' => {
                if in_quotes {
                    // A closing quote always ends a token, even an empty one.
                    parts.push(std::mem::take(&mut current));
                } else if !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                }
                in_quotes = !in_quotes;
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn load_str(contents: &str) -> Vec<OnDemandStart> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        load(file.path())
    }

    #[test]
    fn missing_file_is_an_empty_table() {
        assert!(load(Path::new("/nonexistent/a314d.conf")).is_empty());
    }

    #[test]
    fn parses_name_program_and_arguments() {
        let services = load_str("disk /usr/bin/a314disk -v --root /srv\n");
        assert_eq!(services.len(), 1);
        let s = &services[0];
        assert_eq!(s.service_name, "disk");
        assert_eq!(s.program, "/usr/bin/a314disk");
        assert_eq!(
            s.arguments,
            vec!["/usr/bin/a314disk", "-v", "--root", "/srv"]
        );
    }

    #[test]
    fn quotes_group_tokens_with_spaces() {
        let services = load_str("files /usr/bin/share \"/home/pi/My Files\"\n");
        assert_eq!(
            services[0].arguments,
            vec!["/usr/bin/share", "/home/pi/My Files"]
        );
    }

    #[test]
    fn blank_lines_and_short_lines_are_skipped() {
        let services = load_str("\n\nlonely\n\necho /bin/echosrv\n");
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].service_name, "echo");
    }

    #[test]
    fn multiple_services_in_order() {
        let services = load_str("a /bin/a\nb /bin/b --flag\n");
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].service_name, "a");
        assert_eq!(services[1].service_name, "b");
    }

    #[test]
    fn empty_quoted_token_is_kept() {
        let services = load_str("svc /bin/prog \"\"\n");
        assert_eq!(services[0].arguments, vec!["/bin/prog", ""]);
    }
}
