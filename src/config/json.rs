//! 去掉 JSON 中的注释与尾随逗号。
//!
//! 宿主下发的配置允许 `//`、`/* */` 注释和 `}` / `]` 前的尾随逗号，
//! 喂给 serde_json 之前先在这里清洗。字符串字面量（含转义引号）原样保留。

#[derive(PartialEq, Clone, Copy)]
enum Comment {
    None,
    Single,
    Multi,
}

fn is_escaped(json: &[u8], quote_position: usize) -> bool {
    let mut backslash_count = 0;
    let mut index = quote_position;
    while index > 0 && json[index - 1] == b'\\' {
        index -= 1;
        backslash_count += 1;
    }
    backslash_count % 2 == 1
}

pub fn strip_json(json: &str) -> String {
    let bytes = json.as_bytes();
    let mut inside_string = false;
    let mut comment = Comment::None;
    let mut offset = 0usize;
    let mut buffer = String::new();
    let mut result = String::new();
    let mut comma_pending = false;

    let mut index = 0usize;
    while index < bytes.len() {
        let current = bytes[index];
        let next = bytes.get(index + 1).copied().unwrap_or(0);

        if comment == Comment::None && current == b'"' && !is_escaped(bytes, index) {
            inside_string = !inside_string;
        }

        if inside_string {
            index += 1;
            continue;
        }

        if comment == Comment::None && current == b'/' && next == b'/' {
            buffer.push_str(&json[offset..index]);
            offset = index;
            comment = Comment::Single;
            index += 1;
        } else if comment == Comment::Single && current == b'\r' && next == b'\n' {
            index += 1;
            comment = Comment::None;
            offset = index;
        } else if comment == Comment::Single && current == b'\n' {
            comment = Comment::None;
            offset = index;
        } else if comment == Comment::None && current == b'/' && next == b'*' {
            buffer.push_str(&json[offset..index]);
            offset = index;
            comment = Comment::Multi;
            index += 1;
        } else if comment == Comment::Multi && current == b'*' && next == b'/' {
            index += 1;
            comment = Comment::None;
            offset = index + 1;
        } else if comment == Comment::None {
            if comma_pending {
                if current == b'}' || current == b']' {
                    // 尾随逗号：丢弃 buffer 里打头的逗号
                    buffer.push_str(&json[offset..index]);
                    result.push_str(&buffer[1..]);
                    buffer.clear();
                    offset = index;
                    comma_pending = false;
                } else if !matches!(current, b' ' | b'\t' | b'\r' | b'\n') {
                    // 逗号后出现实际内容，不是尾随逗号
                    buffer.push_str(&json[offset..index]);
                    offset = index;
                    comma_pending = false;
                }
            } else if current == b',' {
                result.push_str(&buffer);
                result.push_str(&json[offset..index]);
                buffer.clear();
                offset = index;
                comma_pending = true;
            }
        }

        index += 1;
    }

    // 未闭合的注释吞掉余下内容
    let tail = if comment == Comment::None { &json[offset..] } else { "" };

    result + &buffer + tail
}
