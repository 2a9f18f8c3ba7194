//! Casemapping and mask-matching helpers shared across the daemon.

/// Fold a string with RFC1459 casemapping.
///
/// IRC treats `[]\~` as the upper-case forms of `{}|^` in addition to the
/// ASCII letters. All dictionary keys (nicks, channel names, server names)
/// are folded through this before lookup.
pub fn irc_to_lower(s: &str) -> String {
    s.chars().map(fold_char).collect()
}

/// Compare two strings with RFC1459 casemapping.
#[allow(dead_code)] // Handy for service modules comparing unfolded keys.
pub fn irc_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.chars()
        .zip(b.chars())
        .all(|(ca, cb)| fold_char(ca) == fold_char(cb))
}

fn fold_char(c: char) -> char {
    match c {
        '[' => '{',
        ']' => '}',
        '\\' => '|',
        '~' => '^',
        'A'..='Z' => c.to_ascii_lowercase(),
        _ => c,
    }
}

/// Match `text` against an IRC glob `pattern` (`*` and `?` wildcards),
/// casemapped per RFC1459.
pub fn match_ircglob(text: &str, pattern: &str) -> bool {
    let t: Vec<char> = text.chars().map(fold_char).collect();
    let p: Vec<char> = pattern.chars().map(fold_char).collect();
    glob_match(&t, &p)
}

fn glob_match(text: &[char], pat: &[char]) -> bool {
    let (mut ti, mut pi) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while ti < text.len() {
        if pi < pat.len() && (pat[pi] == '?' || pat[pi] == text[ti]) {
            ti += 1;
            pi += 1;
        } else if pi < pat.len() && pat[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < pat.len() && pat[pi] == '*' {
        pi += 1;
    }
    pi == pat.len()
}

/// Whether glob `superset` covers every string that glob `subset` can match.
///
/// Used for the ban-list invariant: a new ban swallows existing bans that are
/// subsets of it. This is the conservative glob-on-glob match: wildcards in
/// the subset must be matched by wildcards in the superset.
pub fn match_ircglobs(superset: &str, subset: &str) -> bool {
    let sup: Vec<char> = superset.chars().map(fold_char).collect();
    let sub: Vec<char> = subset.chars().map(fold_char).collect();
    glob_covers(&sup, &sub)
}

fn glob_covers(sup: &[char], sub: &[char]) -> bool {
    let (mut si, mut bi) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while bi < sub.len() {
        if si < sup.len() && sup[si] == '*' {
            star = Some((si, bi));
            si += 1;
        } else if si < sup.len()
            && sub[bi] != '*'
            && (sup[si] == sub[bi] || (sup[si] == '?' && sub[bi] != '?'))
        {
            si += 1;
            bi += 1;
        } else if let Some((ss, sb)) = star {
            si = ss + 1;
            bi = sb + 1;
            star = Some((ss, sb + 1));
        } else {
            return false;
        }
    }
    while si < sup.len() && sup[si] == '*' {
        si += 1;
    }
    si == sup.len()
}

/// Validate a channel name: `#`-prefixed, no control characters, commas, or
/// non-breaking spaces.
pub fn is_channel_name(name: &str) -> bool {
    let mut chars = name.chars();
    if chars.next() != Some('#') {
        return false;
    }
    name.chars().skip(1).all(|c| {
        let v = c as u32;
        v == 0 || (v > 32 && c != ',' && c != '\u{a0}')
    }) && name.len() > 1
}

/// Validate a nickname per the ircd's character set.
pub fn is_valid_nick(nick: &str, max_len: usize) -> bool {
    let mut chars = nick.chars();
    let first = match chars.next() {
        Some(c) => c,
        None => return false,
    };
    if !first.is_ascii_alphabetic() && !"{|}~[\\]^_`".contains(first) {
        return false;
    }
    if !nick
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "{|}~[\\]^-_`".contains(c))
    {
        return false;
    }
    nick.len() <= max_len
}

/// Normalize a gline target to `user@host` form.
pub fn normalize_gline_target(target: &str) -> String {
    if target.contains('@') {
        target.to_string()
    } else {
        format!("*@{}", target)
    }
}
