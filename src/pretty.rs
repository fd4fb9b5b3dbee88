pub(crate) fn try_into_human_readable<N: Into<u64>>(original: N) -> (f64, char) {
    let mut number = original.into() as f64;
    const SUFFIXES: [char; 8] = ['B', 'K', 'M', 'G', 'T', 'P', 'E', 'Z' ];
    let mut suffix_id = 0;
    while number >= 1024.0 && suffix_id < 7 {
        number /= 1024.0;
        suffix_id += 1;
    }
    (number, SUFFIXES[suffix_id])
}

pub(crate) fn human_readable<N: Into<u64>>(original: N) -> String {
    match try_into_human_readable(original) {
        (number, 'B') => format!("{}B", number),
        (number, suffix) => format!("{:.2}{}", number, suffix),
    }
}
