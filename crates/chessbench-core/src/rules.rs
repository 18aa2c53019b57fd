//! 盤面ルールの窓口
//!
//! 合法手生成と FEN の解釈は `chess` crate に任せる。パイプライン側は
//! [`Rules`] トレイト越しにだけ盤面へ触れる。

use std::str::FromStr;

use chess::{
    BitBoard, Board, BoardStatus, ChessMove, Color, EMPTY, File, MoveGen, Piece, Rank, Square,
    get_bishop_moves, get_king_moves, get_knight_moves, get_pawn_attacks, get_rook_moves,
};

use crate::error::RulesError;
use crate::types::Side;

/// 開始局面
pub const START_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

/// 局面の要約
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionFacts {
    pub side_to_move: Side,
    pub legal_move_count: u32,
    pub in_check: bool,
    pub white_queens: u32,
    pub black_queens: u32,
    /// 玉を除く駒の点数（P=1 N=B=3 R=5 Q=9）
    pub material: u32,
    pub insufficient_material: bool,
    pub halfmove_clock: u32,
    pub fullmove_number: u32,
}

impl PositionFacts {
    pub fn both_queens(&self) -> bool {
        self.white_queens > 0 && self.black_queens > 0
    }

    /// 合法手なし（詰み・ステイルメイト）または駒不足
    pub fn is_terminal(&self) -> bool {
        self.legal_move_count == 0 || self.insufficient_material
    }

    /// ply 番号（開始局面 = 0）
    pub fn ply(&self) -> u32 {
        let base = self.fullmove_number.saturating_sub(1) * 2;
        match self.side_to_move {
            Side::White => base,
            Side::Black => base + 1,
        }
    }
}

/// 棋譜再生の1手後の局面
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlyPosition {
    /// 指し終えた手数（1始まり）
    pub ply: u32,
    /// 6フィールド FEN
    pub fen: String,
    pub halfmove_clock: u32,
}

/// 盤面ルールのインターフェース
pub trait Rules: Send + Sync {
    /// 合法手（UCI 表記、生成順）
    fn legal_moves(&self, fen: &str) -> Result<Vec<String>, RulesError>;

    /// FEN のアンパッサン欄が指すマスへ、今この手番で実際に取れるか
    fn is_en_passant_capture_legal(&self, fen: &str) -> Result<bool, RulesError>;

    /// 静的駒交換評価（centipawn、手番側視点）
    fn static_exchange_eval(&self, fen: &str, mv: &str) -> Result<i32, RulesError>;

    /// 玉を除く両者の駒の点数
    fn material_count(&self, fen: &str) -> Result<u32, RulesError>;

    fn inspect(&self, fen: &str) -> Result<PositionFacts, RulesError>;

    fn is_check_or_capture(&self, fen: &str, mv: &str) -> Result<bool, RulesError>;

    /// 1手進めた局面の6フィールド FEN
    fn play(&self, fen: &str, mv: &str) -> Result<String, RulesError>;

    /// 開始局面から指し手列（UCI か SAN）を再生し、各手の後の局面を返す
    fn replay(&self, moves: &[String]) -> Result<Vec<PlyPosition>, RulesError>;
}

/// `chess` crate による実装
#[derive(Debug, Clone, Copy, Default)]
pub struct ChessRules;

impl ChessRules {
    pub fn new() -> Self {
        Self
    }
}

// SEE 用の駒価値
const SEE_PAWN: i32 = 100;
const SEE_KNIGHT: i32 = 320;
const SEE_BISHOP: i32 = 330;
const SEE_ROOK: i32 = 500;
const SEE_QUEEN: i32 = 900;
const SEE_KING: i32 = 20_000;

fn see_value(piece: Piece) -> i32 {
    match piece {
        Piece::Pawn => SEE_PAWN,
        Piece::Knight => SEE_KNIGHT,
        Piece::Bishop => SEE_BISHOP,
        Piece::Rook => SEE_ROOK,
        Piece::Queen => SEE_QUEEN,
        Piece::King => SEE_KING,
    }
}

fn material_value(piece: Piece) -> u32 {
    match piece {
        Piece::Pawn => 1,
        Piece::Knight | Piece::Bishop => 3,
        Piece::Rook => 5,
        Piece::Queen => 9,
        Piece::King => 0,
    }
}

/// 盤面とテキスト由来の付帯情報
#[derive(Debug, Clone)]
struct Loaded {
    board: Board,
    /// FEN に書かれていたアンパッサン対象マス（合法性は問わない）
    ep_target: Option<Square>,
    halfmove: u32,
    fullmove: u32,
}

fn load(fen: &str) -> Result<Loaded, RulesError> {
    let invalid = || RulesError::InvalidFen(fen.to_string());
    let fields: Vec<&str> = fen.split_whitespace().collect();
    if fields.len() < 4 || fields.len() > 6 {
        return Err(invalid());
    }
    Side::from_fen_field(fields[1]).ok_or_else(invalid)?;
    let ep_target = match fields[3] {
        "-" => None,
        sq => Some(Square::from_str(sq).map_err(|_| invalid())?),
    };
    let halfmove = match fields.get(4) {
        Some(v) => v.parse::<u32>().map_err(|_| invalid())?,
        None => 0,
    };
    let fullmove = match fields.get(5) {
        Some(v) => v.parse::<u32>().map_err(|_| invalid())?.max(1),
        None => 1,
    };

    let full = format!(
        "{} {} {} {} {} {}",
        fields[0], fields[1], fields[2], fields[3], halfmove, fullmove
    );
    let board = match Board::from_str(&full) {
        Ok(b) => b,
        // 取れないアンパッサン欄を拒否する実装でも読めるように外して再試行する
        Err(_) if ep_target.is_some() => {
            let stripped = format!(
                "{} {} {} - {} {}",
                fields[0], fields[1], fields[2], halfmove, fullmove
            );
            Board::from_str(&stripped).map_err(|_| invalid())?
        }
        Err(_) => return Err(invalid()),
    };

    Ok(Loaded {
        board,
        ep_target,
        halfmove,
        fullmove,
    })
}

fn side_of(color: Color) -> Side {
    match color {
        Color::White => Side::White,
        Color::Black => Side::Black,
    }
}

fn legal_list(board: &Board) -> Vec<ChessMove> {
    MoveGen::new_legal(board).collect()
}

/// UCI 表記を優先し、駄目なら SAN として解釈する
fn resolve_move(board: &Board, fen: &str, text: &str) -> Result<ChessMove, RulesError> {
    let illegal = || RulesError::IllegalMove {
        fen: fen.to_string(),
        mv: text.to_string(),
    };
    let trimmed = text.trim();
    if let Some(m) = legal_list(board).into_iter().find(|m| m.to_string() == trimmed) {
        return Ok(m);
    }
    let san = trimmed.trim_end_matches(['+', '#', '!', '?']);
    match ChessMove::from_san(board, san) {
        Ok(m) if board.legal(m) => Ok(m),
        _ => Err(illegal()),
    }
}

fn is_en_passant_move(board: &Board, mv: ChessMove) -> bool {
    board.piece_on(mv.get_source()) == Some(Piece::Pawn)
        && mv.get_source().get_file() != mv.get_dest().get_file()
        && board.piece_on(mv.get_dest()).is_none()
}

fn is_capture(board: &Board, mv: ChessMove) -> bool {
    board.piece_on(mv.get_dest()).is_some() || is_en_passant_move(board, mv)
}

/// `occupied` を盤面占有とみなしたときに `sq` へ利いている駒（両色）
fn attackers_to(board: &Board, sq: Square, occupied: BitBoard) -> BitBoard {
    let pawns = *board.pieces(Piece::Pawn);
    let queens = *board.pieces(Piece::Queen);
    let rooks = *board.pieces(Piece::Rook) | queens;
    let bishops = *board.pieces(Piece::Bishop) | queens;
    let white = *board.color_combined(Color::White);
    let black = *board.color_combined(Color::Black);

    let mut att = get_knight_moves(sq) & *board.pieces(Piece::Knight);
    att |= get_king_moves(sq) & *board.pieces(Piece::King);
    att |= get_rook_moves(sq, occupied) & rooks;
    att |= get_bishop_moves(sq, occupied) & bishops;
    // 黒ポーンが sq に利く = sq にいる白ポーンの利き先に黒ポーンがいる
    att |= get_pawn_attacks(sq, Color::White, pawns & black);
    att |= get_pawn_attacks(sq, Color::Black, pawns & white);
    att & occupied
}

fn least_valuable(board: &Board, attackers: BitBoard) -> Option<(Square, Piece)> {
    const ORDER: [Piece; 6] = [
        Piece::Pawn,
        Piece::Knight,
        Piece::Bishop,
        Piece::Rook,
        Piece::Queen,
        Piece::King,
    ];
    ORDER.iter().find_map(|&p| {
        let bb = attackers & *board.pieces(p);
        (bb != EMPTY).then(|| (bb.to_square(), p))
    })
}

/// スワップリストによる SEE。ピンは考慮しない。
fn see(board: &Board, mv: ChessMove) -> i32 {
    let from = mv.get_source();
    let to = mv.get_dest();
    let Some(mover) = board.piece_on(from) else {
        return 0;
    };

    let mut occupied = *board.combined() ^ BitBoard::from_square(from);
    let mut gain = [0i32; 40];
    gain[0] = if is_en_passant_move(board, mv) {
        let behind = Square::make_square(from.get_rank(), to.get_file());
        occupied ^= BitBoard::from_square(behind);
        SEE_PAWN
    } else {
        board.piece_on(to).map(see_value).unwrap_or(0)
    };

    // 成りは昇格分を得として最初の取りに上乗せし、以後は昇格後の駒が取られる対象になる
    let mut on_square = match mv.get_promotion() {
        Some(promo) => {
            gain[0] += see_value(promo) - SEE_PAWN;
            see_value(promo)
        }
        None => see_value(mover),
    };

    let mut stm = !board.side_to_move();
    let mut depth = 0usize;
    loop {
        let ours = attackers_to(board, to, occupied) & *board.color_combined(stm);
        let Some((sq, piece)) = least_valuable(board, ours) else {
            break;
        };
        depth += 1;
        if depth >= gain.len() {
            break;
        }
        gain[depth] = on_square - gain[depth - 1];
        on_square = see_value(piece);
        occupied ^= BitBoard::from_square(sq);
        stm = !stm;
    }
    let mut d = depth.min(gain.len() - 1);
    while d > 0 {
        gain[d - 1] = -((-gain[d - 1]).max(gain[d]));
        d -= 1;
    }
    gain[0]
}

/// 駒不足による引き分け（K vs K、K+小駒1枚 vs K、ビショップがすべて同じ色のマス）
fn insufficient_material(board: &Board) -> bool {
    let heavy = *board.pieces(Piece::Pawn) | *board.pieces(Piece::Rook) | *board.pieces(Piece::Queen);
    if heavy != EMPTY {
        return false;
    }
    let knights = *board.pieces(Piece::Knight);
    let bishops = *board.pieces(Piece::Bishop);
    if (knights | bishops).popcnt() <= 1 {
        return true;
    }
    if knights != EMPTY {
        return false;
    }
    let on_light = bishops.filter(|sq| is_light_square(*sq)).count();
    on_light == 0 || on_light == bishops.popcnt() as usize
}

fn is_light_square(sq: Square) -> bool {
    (sq.get_rank().to_index() + sq.get_file().to_index()) % 2 == 1
}

fn material_of(board: &Board) -> u32 {
    [Piece::Pawn, Piece::Knight, Piece::Bishop, Piece::Rook, Piece::Queen]
        .iter()
        .map(|&p| board.pieces(p).popcnt() * material_value(p))
        .sum()
}

/// `ep_target` へ手番側が実際に取れるか（取った後に自玉が素通しにならないことまで確認）
fn en_passant_capturable(board: &Board, ep_target: Square) -> bool {
    let us = board.side_to_move();
    let them = !us;
    let (target_rank, pushed) = match us {
        Color::White => (Rank::Sixth, ep_target.down()),
        Color::Black => (Rank::Third, ep_target.up()),
    };
    if ep_target.get_rank() != target_rank || board.piece_on(ep_target).is_some() {
        return false;
    }
    let Some(victim) = pushed else {
        return false;
    };
    if board.piece_on(victim) != Some(Piece::Pawn) || board.color_on(victim) != Some(them) {
        return false;
    }

    let our_pawns = *board.pieces(Piece::Pawn) & *board.color_combined(us);
    let capturers = get_pawn_attacks(ep_target, them, our_pawns);
    let king = board.king_square(us);
    let enemy_after = *board.color_combined(them) ^ BitBoard::from_square(victim);

    capturers.into_iter().any(|from| {
        let occupied = *board.combined()
            ^ BitBoard::from_square(from)
            ^ BitBoard::from_square(victim)
            ^ BitBoard::from_square(ep_target);
        let rooks = (*board.pieces(Piece::Rook) | *board.pieces(Piece::Queen)) & enemy_after;
        let bishops = (*board.pieces(Piece::Bishop) | *board.pieces(Piece::Queen)) & enemy_after;
        let knights = *board.pieces(Piece::Knight) & enemy_after;
        let pawns = *board.pieces(Piece::Pawn) & enemy_after;
        let kings = *board.pieces(Piece::King) & enemy_after;
        let attacked = (get_rook_moves(king, occupied) & rooks) != EMPTY
            || (get_bishop_moves(king, occupied) & bishops) != EMPTY
            || (get_knight_moves(king) & knights) != EMPTY
            || get_pawn_attacks(king, us, pawns) != EMPTY
            || (get_king_moves(king) & kings) != EMPTY;
        !attacked
    })
}

fn piece_char(piece: Piece, color: Color) -> char {
    let c = match piece {
        Piece::Pawn => 'p',
        Piece::Knight => 'n',
        Piece::Bishop => 'b',
        Piece::Rook => 'r',
        Piece::Queen => 'q',
        Piece::King => 'k',
    };
    match color {
        Color::White => c.to_ascii_uppercase(),
        Color::Black => c,
    }
}

fn placement(board: &Board) -> String {
    let mut out = String::with_capacity(72);
    for r in (0..8).rev() {
        let mut empty: u8 = 0;
        for f in 0..8 {
            let sq = Square::make_square(Rank::from_index(r), File::from_index(f));
            match (board.piece_on(sq), board.color_on(sq)) {
                (Some(p), Some(c)) => {
                    if empty > 0 {
                        out.push(char::from(b'0' + empty));
                        empty = 0;
                    }
                    out.push(piece_char(p, c));
                }
                _ => empty += 1,
            }
        }
        if empty > 0 {
            out.push(char::from(b'0' + empty));
        }
        if r > 0 {
            out.push('/');
        }
    }
    out
}

fn castling_field(board: &Board) -> String {
    let mut s = String::new();
    let white = board.castle_rights(Color::White);
    let black = board.castle_rights(Color::Black);
    if white.has_kingside() {
        s.push('K');
    }
    if white.has_queenside() {
        s.push('Q');
    }
    if black.has_kingside() {
        s.push('k');
    }
    if black.has_queenside() {
        s.push('q');
    }
    if s.is_empty() {
        s.push('-');
    }
    s
}

fn to_fen(state: &Loaded) -> String {
    let side = match state.board.side_to_move() {
        Color::White => 'w',
        Color::Black => 'b',
    };
    let ep = state
        .ep_target
        .map(|sq| sq.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{} {} {} {} {} {}",
        placement(&state.board),
        side,
        castling_field(&state.board),
        ep,
        state.halfmove,
        state.fullmove
    )
}

/// 1手進める。アンパッサン欄は2マス突きの直後に必ず書く（取れるかは正規化で判定）。
fn advance(state: &Loaded, mv: ChessMove) -> Loaded {
    let board = &state.board;
    let pawn_move = board.piece_on(mv.get_source()) == Some(Piece::Pawn);
    let halfmove = if pawn_move || is_capture(board, mv) {
        0
    } else {
        state.halfmove + 1
    };
    let from_rank = mv.get_source().get_rank().to_index();
    let to_rank = mv.get_dest().get_rank().to_index();
    let ep_target = if pawn_move && from_rank.abs_diff(to_rank) == 2 {
        let mid = Rank::from_index((from_rank + to_rank) / 2);
        Some(Square::make_square(mid, mv.get_source().get_file()))
    } else {
        None
    };
    let fullmove = match board.side_to_move() {
        Color::Black => state.fullmove + 1,
        Color::White => state.fullmove,
    };
    Loaded {
        board: board.make_move_new(mv),
        ep_target,
        halfmove,
        fullmove,
    }
}

impl Rules for ChessRules {
    fn legal_moves(&self, fen: &str) -> Result<Vec<String>, RulesError> {
        let state = load(fen)?;
        Ok(legal_list(&state.board).iter().map(|m| m.to_string()).collect())
    }

    fn is_en_passant_capture_legal(&self, fen: &str) -> Result<bool, RulesError> {
        let state = load(fen)?;
        Ok(match state.ep_target {
            Some(sq) => en_passant_capturable(&state.board, sq),
            None => false,
        })
    }

    fn static_exchange_eval(&self, fen: &str, mv: &str) -> Result<i32, RulesError> {
        let state = load(fen)?;
        let m = resolve_move(&state.board, fen, mv)?;
        Ok(see(&state.board, m))
    }

    fn material_count(&self, fen: &str) -> Result<u32, RulesError> {
        Ok(material_of(&load(fen)?.board))
    }

    fn inspect(&self, fen: &str) -> Result<PositionFacts, RulesError> {
        let state = load(fen)?;
        let board = &state.board;
        let queens = *board.pieces(Piece::Queen);
        Ok(PositionFacts {
            side_to_move: side_of(board.side_to_move()),
            legal_move_count: MoveGen::new_legal(board).len() as u32,
            in_check: *board.checkers() != EMPTY,
            white_queens: (queens & *board.color_combined(Color::White)).popcnt(),
            black_queens: (queens & *board.color_combined(Color::Black)).popcnt(),
            material: material_of(board),
            insufficient_material: insufficient_material(board),
            halfmove_clock: state.halfmove,
            fullmove_number: state.fullmove,
        })
    }

    fn is_check_or_capture(&self, fen: &str, mv: &str) -> Result<bool, RulesError> {
        let state = load(fen)?;
        let m = resolve_move(&state.board, fen, mv)?;
        if is_capture(&state.board, m) {
            return Ok(true);
        }
        let after = state.board.make_move_new(m);
        Ok(*after.checkers() != EMPTY)
    }

    fn play(&self, fen: &str, mv: &str) -> Result<String, RulesError> {
        let state = load(fen)?;
        let m = resolve_move(&state.board, fen, mv)?;
        Ok(to_fen(&advance(&state, m)))
    }

    fn replay(&self, moves: &[String]) -> Result<Vec<PlyPosition>, RulesError> {
        let mut state = load(START_FEN)?;
        let mut out = Vec::with_capacity(moves.len());
        for (i, text) in moves.iter().enumerate() {
            if state.board.status() != BoardStatus::Ongoing {
                return Err(RulesError::IllegalMove {
                    fen: to_fen(&state),
                    mv: text.clone(),
                });
            }
            let fen = to_fen(&state);
            let m = resolve_move(&state.board, &fen, text)?;
            state = advance(&state, m);
            out.push(PlyPosition {
                ply: i as u32 + 1,
                fen: to_fen(&state),
                halfmove_clock: state.halfmove,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn moves(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn start_position_facts() {
        let facts = ChessRules.inspect(START_FEN).unwrap();
        assert_eq!(facts.side_to_move, Side::White);
        assert_eq!(facts.legal_move_count, 20);
        assert_eq!(facts.material, 78);
        assert!(facts.both_queens());
        assert!(!facts.in_check);
        assert!(!facts.is_terminal());
        assert_eq!(facts.ply(), 0);
    }

    #[test]
    fn four_field_fen_is_accepted() {
        let rules = ChessRules;
        let n = rules
            .legal_moves("rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq -")
            .unwrap()
            .len();
        assert_eq!(n, 20);
        assert!(rules.legal_moves("not a fen").is_err());
    }

    #[test]
    fn replay_tracks_clocks_and_ep_square() {
        let err = ChessRules
            .replay(&moves(&["e4", "Nf6", "Nc3", "e2e4"]))
            .unwrap_err();
        assert!(matches!(err, RulesError::IllegalMove { .. }));

        let positions = ChessRules.replay(&moves(&["e2e4", "g8f6", "b1c3"])).unwrap();
        assert_eq!(positions.len(), 3);
        assert_eq!(
            positions[0].fen,
            "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq e3 0 1"
        );
        assert_eq!(positions[2].halfmove_clock, 2);
        assert_eq!(positions[2].ply, 3);
    }

    #[test]
    fn en_passant_legality() {
        let rules = ChessRules;
        // e3 は記録されているが、取れる黒ポーンがいない
        let fen = "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq e3 0 1";
        assert!(!rules.is_en_passant_capture_legal(fen).unwrap());
        // d4 のポーンが e3 へ取れる
        let fen = "rnbqkbnr/ppp1pppp/8/8/3pP3/8/PPPP1PPP/RNBQKBNR b KQkq e3 0 3";
        assert!(rules.is_en_passant_capture_legal(fen).unwrap());
        assert!(rules.legal_moves(fen).unwrap().contains(&"d4e3".to_string()));
        // 取ると横から王手が通るので取れない
        let fen = "8/8/8/8/k2pP2R/8/8/4K3 b - e3 0 1";
        assert!(!rules.is_en_passant_capture_legal(fen).unwrap());
    }

    #[test]
    fn see_on_simple_exchanges() {
        let rules = ChessRules;
        // 守られていないナイトをポーンで取る
        let fen = "4k3/8/8/3n4/4P3/8/8/4K3 w - - 0 1";
        assert_eq!(rules.static_exchange_eval(fen, "e4d5").unwrap(), SEE_KNIGHT);
        // ポーンで守られたポーンをクイーンで取る
        let fen = "4k3/8/2p5/3p4/8/8/3Q4/4K3 w - - 0 1";
        assert_eq!(
            rules.static_exchange_eval(fen, "d2d5").unwrap(),
            SEE_PAWN - SEE_QUEEN
        );
        // 取りのない手は 0
        assert_eq!(rules.static_exchange_eval(START_FEN, "g1f3").unwrap(), 0);
    }

    #[test]
    fn check_or_capture_detection() {
        let rules = ChessRules;
        let fen = "4k3/8/8/3n4/4P3/8/8/R3K3 w - - 0 1";
        assert!(rules.is_check_or_capture(fen, "e4d5").unwrap());
        assert!(rules.is_check_or_capture(fen, "a1a8").unwrap());
        assert!(!rules.is_check_or_capture(fen, "a1a2").unwrap());
    }

    #[test]
    fn insufficient_material_counts_as_terminal() {
        let facts = ChessRules.inspect("8/8/8/4k3/8/8/8/4KN2 w - - 0 1").unwrap();
        assert!(facts.insufficient_material);
        assert!(facts.is_terminal());
        let facts = ChessRules.inspect("8/8/8/4k3/8/8/4P3/4K3 w - - 0 1").unwrap();
        assert!(!facts.is_terminal());
    }

    #[test]
    fn bishops_on_one_colour_are_insufficient() {
        // c1 と f8 はどちらも暗マス
        assert!(ChessRules.inspect("5b2/8/8/4k3/8/8/8/2B1K3 w - - 0 1").unwrap().insufficient_material);
        // c8 は明マス
        assert!(!ChessRules.inspect("2b5/8/8/4k3/8/8/8/2B1K3 w - - 0 1").unwrap().insufficient_material);
        assert!(!ChessRules.inspect("5n2/8/8/4k3/8/8/8/2B1K3 w - - 0 1").unwrap().insufficient_material);
    }

    #[test]
    fn play_applies_one_move() {
        let fen = ChessRules.play(START_FEN, "g1f3").unwrap();
        assert_eq!(
            fen,
            "rnbqkbnr/pppppppp/8/8/8/5N2/PPPPPPPP/RNBQKB1R b KQkq - 1 1"
        );
        assert!(ChessRules.play(START_FEN, "e2e5").is_err());
    }
}
