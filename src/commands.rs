/// Console commands and name resolution

#[derive(Debug, Clone)]
pub struct Command {
  pub name: &'static str,
  pub aliases: &'static [&'static str],
  pub usage: &'static str,
  pub description: &'static str,
}

/// All available commands
pub const COMMANDS: &[Command] = &[
  Command {
    name: "sample",
    aliases: &["s", "scan"],
    usage: "sample <well_id>",
    description: "Mark a well as sampled",
  },
  Command {
    name: "unsample",
    aliases: &["u", "undo"],
    usage: "unsample <well_id>",
    description: "Reset a well to not sampled",
  },
  Command {
    name: "stats",
    aliases: &["st", "progress"],
    usage: "stats [daily]",
    description: "Show sampling progress",
  },
  Command {
    name: "logs",
    aliases: &["l", "log", "history"],
    usage: "logs [limit]",
    description: "Show recent activity",
  },
  Command {
    name: "pending",
    aliases: &["p", "dirty"],
    usage: "pending",
    description: "List wells waiting to be synced",
  },
  Command {
    name: "sync",
    aliases: &["sy", "push"],
    usage: "sync",
    description: "Push local changes now",
  },
  Command {
    name: "activate",
    aliases: &["a", "update"],
    usage: "activate",
    description: "Switch to a waiting cache version",
  },
  Command {
    name: "help",
    aliases: &["h", "?"],
    usage: "help",
    description: "List commands",
  },
  Command {
    name: "quit",
    aliases: &["q", "exit"],
    usage: "quit",
    description: "Exit wellsync",
  },
];

/// Get suggestions for a given input, best match first
pub fn get_suggestions(input: &str) -> Vec<&'static Command> {
  let input_lower = input.to_lowercase();

  if input_lower.is_empty() {
    return COMMANDS.iter().collect();
  }

  let mut matches: Vec<(&Command, u32)> = Vec::new();

  for cmd in COMMANDS {
    // Exact match on name
    if cmd.name == input_lower {
      matches.push((cmd, 0)); // Highest priority
      continue;
    }

    // Exact match on alias
    if cmd.aliases.contains(&input_lower.as_str()) {
      matches.push((cmd, 1));
      continue;
    }

    // Prefix match on name
    if cmd.name.starts_with(&input_lower) {
      matches.push((cmd, 2));
      continue;
    }

    // Prefix match on alias
    if cmd.aliases.iter().any(|a| a.starts_with(&input_lower)) {
      matches.push((cmd, 3));
      continue;
    }

    // Fuzzy match (contains)
    if cmd.name.contains(&input_lower) {
      matches.push((cmd, 4));
      continue;
    }

    // Fuzzy match on alias
    if cmd.aliases.iter().any(|a| a.contains(&input_lower)) {
      matches.push((cmd, 5));
    }
  }

  // Sort by priority
  matches.sort_by_key(|(_, priority)| *priority);

  matches.into_iter().map(|(cmd, _)| cmd).collect()
}

/// Split a console line into the best matching command and its arguments.
pub fn parse(line: &str) -> Option<(&'static Command, Vec<&str>)> {
  let mut words = line.split_whitespace();
  let first = words.next()?;
  let cmd = get_suggestions(first).into_iter().next()?;
  Some((cmd, words.collect()))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_input_returns_all() {
    let suggestions = get_suggestions("");
    assert_eq!(suggestions.len(), COMMANDS.len());
  }

  #[test]
  fn test_exact_match() {
    let suggestions = get_suggestions("sample");
    assert!(!suggestions.is_empty());
    assert_eq!(suggestions[0].name, "sample");
  }

  #[test]
  fn test_alias_match() {
    let suggestions = get_suggestions("st");
    assert!(!suggestions.is_empty());
    assert_eq!(suggestions[0].name, "stats");
  }

  #[test]
  fn test_prefix_match() {
    let suggestions = get_suggestions("pend");
    assert!(!suggestions.is_empty());
    assert_eq!(suggestions[0].name, "pending");
  }

  #[test]
  fn test_fuzzy_match() {
    let suggestions = get_suggestions("sampl");
    assert_eq!(suggestions[0].name, "sample");
    // "unsample" contains it but ranks below the prefix match
    assert!(suggestions.iter().any(|c| c.name == "unsample"));
  }

  #[test]
  fn test_parse_splits_arguments() {
    let (cmd, args) = parse("  s  W-042 ").unwrap();
    assert_eq!(cmd.name, "sample");
    assert_eq!(args, vec!["W-042"]);

    assert!(parse("   ").is_none());
    assert!(parse("zzz").is_none());
  }
}
