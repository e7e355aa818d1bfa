const PACKAGE_LIST_LIMIT: usize = 200;

/// System prompt describing the live interpreter the `execute` tool runs against.
pub fn system_prompt(python_version: &str, packages: &[String]) -> String {
    let package_list = if packages.is_empty() {
        "(package list unavailable)".to_string()
    } else {
        let mut listed = packages
            .iter()
            .take(PACKAGE_LIST_LIMIT)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n");
        if packages.len() > PACKAGE_LIST_LIMIT {
            listed.push_str(&format!(
                "\n... and {} more",
                packages.len() - PACKAGE_LIST_LIMIT
            ));
        }
        listed
    };

    format!(
        r#"You are a helpful assistant with access to a live Python {python_version} interpreter through the `execute` tool.

The following Python packages are installed:
{package_list}

Rules:
1) Code you send is executed immediately and variables persist between calls, so you may make partial progress and build on earlier results.
2) For facts about the running session, run code instead of guessing.
3) Output is captured from stdout and stderr; print what you need to see.
4) If a call raises, read the traceback, adapt and continue when possible.
5) When you have enough information, answer concisely in plain text."#
    )
}

#[cfg(test)]
mod tests {
    use super::system_prompt;

    #[test]
    fn prompt_lists_version_and_packages() {
        let prompt = system_prompt("3.12.1", &["numpy==2.0.0".to_string()]);
        assert!(prompt.contains("Python 3.12.1 interpreter"));
        assert!(prompt.contains("\nnumpy==2.0.0\n"));
        assert!(prompt.contains("`execute` tool"));
    }

    #[test]
    fn prompt_caps_long_package_lists() {
        let packages = (0..205).map(|i| format!("pkg{i}==1.0")).collect::<Vec<_>>();
        let prompt = system_prompt("3.12.1", &packages);
        assert!(prompt.contains("pkg199==1.0"));
        assert!(!prompt.contains("pkg200==1.0"));
        assert!(prompt.contains("... and 5 more"));
    }

    #[test]
    fn prompt_handles_missing_package_list() {
        let prompt = system_prompt("3.11.0", &[]);
        assert!(prompt.contains("(package list unavailable)"));
    }
}
